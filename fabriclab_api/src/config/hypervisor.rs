use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{
        CONFIG_DISK_SIZE_DEFAULT, CONSOLE_PORT_BASE_DEFAULT, FABRIC_BRIDGE, IMAGE_DIR_DEFAULT,
        IMAGE_PATTERN_DEFAULT, IMPORT_POLL_INTERVAL_SECS_DEFAULT, IMPORT_TIMEOUT_SECS_DEFAULT,
        INSTANCE_CONFIG_DIR_DEFAULT, INSTANCE_CONFIG_EXTENSION, MANAGEMENT_BRIDGE,
        MAX_NETWORK_INTERFACES, MAX_NETWORK_INTERFACES_DEFAULT, NAME_SUFFIX_DEFAULT,
        OS_TYPE_DEFAULT, SMBIOS_PRODUCT_DEFAULT, STORAGE_POOL_DEFAULT,
    },
    error::{EnvironmentError, FabricError, InvalidInputError},
};

/// Everything fabriclab needs to know about the hypervisor host it drives.
///
/// A value of this type is handed to every component instead of reaching for
/// well-known paths directly, so that several independent setups can coexist
/// (for instance in tests).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct HypervisorConfig {
    /// Directory holding the installable disk images.
    pub image_dir: PathBuf,

    /// Directory holding one `<id>.conf` descriptor per existing instance.
    pub instance_config_dir: PathBuf,

    /// Glob pattern, relative to `image_dir`, matching image candidates.
    pub image_pattern: String,

    /// Storage pool receiving imported disks.
    pub storage_pool: String,

    /// Bridges attached when an instance does not list its own.
    pub default_bridges: Vec<String>,

    /// The serial console of instance `id` listens on `console_port_base + id`.
    pub console_port_base: u16,

    /// Maximum number of network interfaces attached to one instance.
    pub max_network_interfaces: usize,

    /// Seconds between two checks for a finished disk import.
    pub import_poll_interval_secs: u64,

    /// Seconds after which a disk import is considered failed.
    pub import_timeout_secs: u64,

    /// Suffix appended to the instance name to form its hostname.
    pub name_suffix: String,

    /// SMBIOS product tag passed to the guest.
    pub smbios_product: String,

    /// Guest OS type.
    pub os_type: String,

    /// Size of the secondary configuration disk.
    pub config_disk_size: String,

    /// What to do with a partially created instance after a fatal failure.
    pub on_failure: FailurePolicy,
}

/// Handling of instances left behind by a failed provisioning run.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Leave whatever was already created in place for inspection.
    #[default]
    Leave,

    /// Destroy and purge the instance once creation has happened.
    Destroy,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        let mut default_bridges = vec![MANAGEMENT_BRIDGE.to_string()];
        default_bridges.extend(
            std::iter::repeat(FABRIC_BRIDGE.to_string()).take(MAX_NETWORK_INTERFACES_DEFAULT - 1),
        );

        Self {
            image_dir: IMAGE_DIR_DEFAULT.into(),
            instance_config_dir: INSTANCE_CONFIG_DIR_DEFAULT.into(),
            image_pattern: IMAGE_PATTERN_DEFAULT.into(),
            storage_pool: STORAGE_POOL_DEFAULT.into(),
            default_bridges,
            console_port_base: CONSOLE_PORT_BASE_DEFAULT,
            max_network_interfaces: MAX_NETWORK_INTERFACES_DEFAULT,
            import_poll_interval_secs: IMPORT_POLL_INTERVAL_SECS_DEFAULT,
            import_timeout_secs: IMPORT_TIMEOUT_SECS_DEFAULT,
            name_suffix: NAME_SUFFIX_DEFAULT.into(),
            smbios_product: SMBIOS_PRODUCT_DEFAULT.into(),
            os_type: OS_TYPE_DEFAULT.into(),
            config_disk_size: CONFIG_DISK_SIZE_DEFAULT.into(),
            on_failure: FailurePolicy::default(),
        }
    }
}

impl HypervisorConfig {
    /// Rejects values the provisioning pipeline cannot work with.
    pub fn validate(&self) -> Result<(), FabricError> {
        let reason = if self.import_poll_interval_secs == 0 {
            "import-poll-interval-secs must be at least 1".to_string()
        } else if self.max_network_interfaces == 0
            || self.max_network_interfaces > MAX_NETWORK_INTERFACES
        {
            format!(
                "max-network-interfaces must be between 1 and {MAX_NETWORK_INTERFACES}, got {}",
                self.max_network_interfaces
            )
        } else {
            return Ok(());
        };

        Err(FabricError::new(InvalidInputError::InvalidConfiguration { reason }))
    }

    /// Checks that the directories fabriclab reads from are present.
    pub fn validate_environment(&self) -> Result<(), FabricError> {
        for dir in [&self.image_dir, &self.instance_config_dir] {
            if !dir.is_dir() {
                return Err(FabricError::new(EnvironmentError::MissingDirectory {
                    path: dir.display().to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Path of the descriptor file of instance `id`.
    pub fn instance_config_path(&self, id: u32) -> PathBuf {
        self.instance_config_dir
            .join(format!("{id}.{INSTANCE_CONFIG_EXTENSION}"))
    }

    pub fn import_poll_interval(&self) -> Duration {
        Duration::from_secs(self.import_poll_interval_secs)
    }

    pub fn import_timeout(&self) -> Duration {
        Duration::from_secs(self.import_timeout_secs)
    }
}

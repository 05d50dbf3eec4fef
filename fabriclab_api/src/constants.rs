use const_format::formatcp;

// Hypervisor layout constants

/// Directory holding the installable disk images.
pub const IMAGE_DIR_DEFAULT: &str = "/var/lib/vz/template/qcow";

/// Directory holding one descriptor file per existing instance.
pub const INSTANCE_CONFIG_DIR_DEFAULT: &str = "/etc/pve/qemu-server";

/// Extension of the per-instance descriptor files.
pub const INSTANCE_CONFIG_EXTENSION: &str = "conf";

/// Base name shared by all installable switch images.
pub const IMAGE_BASE_NAME: &str = "vJunos-switch";

/// Glob pattern used to enumerate image candidates.
pub const IMAGE_PATTERN_DEFAULT: &str = formatcp!("{IMAGE_BASE_NAME}-*.qcow2");

/// Storage pool that receives imported disks.
pub const STORAGE_POOL_DEFAULT: &str = "local-lvm";

/// Management bridge, attached as the first interface.
pub const MANAGEMENT_BRIDGE: &str = "vmbr101";

/// Fabric bridge, attached to every remaining interface.
pub const FABRIC_BRIDGE: &str = "vmbr500";

/// Serial consoles are exposed on `CONSOLE_PORT_BASE + id`.
pub const CONSOLE_PORT_BASE_DEFAULT: u16 = 5000;

/// Number of network slots the switch image exposes (net0-net4).
pub const MAX_NETWORK_INTERFACES: usize = 5;

/// Interfaces attached by default: every slot the image exposes.
pub const MAX_NETWORK_INTERFACES_DEFAULT: usize = MAX_NETWORK_INTERFACES;

/// Seconds between two checks for a finished disk import.
pub const IMPORT_POLL_INTERVAL_SECS_DEFAULT: u64 = 3;

/// Seconds to wait for a disk import to show up in the instance configuration.
pub const IMPORT_TIMEOUT_SECS_DEFAULT: u64 = 180;

/// Appended to every instance name to form the hostname.
pub const NAME_SUFFIX_DEFAULT: &str = ".switch";

/// SMBIOS product tag the switch image uses to detect its platform.
pub const SMBIOS_PRODUCT_DEFAULT: &str = "VM-VEX";

/// Guest OS type passed to the hypervisor.
pub const OS_TYPE_DEFAULT: &str = "l26";

/// Size of the secondary configuration disk.
pub const CONFIG_DISK_SIZE_DEFAULT: &str = "16M";

/// Lowest instance identifier the hypervisor accepts.
pub const MIN_INSTANCE_ID: u32 = 100;

/// Default CPU core count of a new instance.
pub const CORES_DEFAULT: u32 = 4;

/// Default memory of a new instance, in MiB.
pub const MEMORY_MIB_DEFAULT: u32 = 8192;

// Agent paths

/// Path to load the hypervisor configuration from.
pub const FABRICLAB_CONFIG_PATH: &str = "/etc/fabriclab/config.yaml";

/// Directory for fabriclab's own logs.
pub const FABRICLAB_LOG_DIR: &str = "/var/log/fabriclab";

/// Path of the JSON background log written by mutating commands.
pub const FABRICLAB_BACKGROUND_LOG_PATH: &str = formatcp!("{FABRICLAB_LOG_DIR}/fabriclab.log");

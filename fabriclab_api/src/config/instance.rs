use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    constants::{CORES_DEFAULT, MEMORY_MIB_DEFAULT, MIN_INSTANCE_ID},
    is_default,
};

/// Identity and shape of one virtual switch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstanceDescriptor {
    /// Hypervisor identifier. Also selects the serial console port.
    pub id: u32,

    /// Instance name, without the hostname suffix.
    pub name: String,

    /// Number of CPU cores.
    #[serde(default = "default_cores")]
    pub cores: u32,

    /// Memory size in MiB.
    #[serde(default = "default_memory")]
    pub memory: u32,

    /// Bridges to attach, in interface order. When empty, the hypervisor's
    /// default bridges are used.
    #[serde(default, skip_serializing_if = "is_default")]
    pub bridges: Vec<String>,

    /// Optional raw disk image carrying first-boot configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_disk: Option<PathBuf>,

    /// Exact image version to install. The newest image is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_version: Option<String>,

    /// Start the instance once it has been provisioned.
    #[serde(default, skip_serializing_if = "is_default")]
    pub start: bool,

    /// Start the instance whenever the hypervisor boots.
    #[serde(default = "default_onboot")]
    pub onboot: bool,
}

fn default_cores() -> u32 {
    CORES_DEFAULT
}

fn default_memory() -> u32 {
    MEMORY_MIB_DEFAULT
}

fn default_onboot() -> bool {
    true
}

#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceValidationError {
    #[error("Instance id {id} is below the minimum of {min}")]
    IdTooLow { id: u32, min: u32 },
    #[error("Instance id {id} puts the console port past 65535")]
    ConsolePortOutOfRange { id: u32 },
    #[error("Instance {id} has an empty name")]
    EmptyName { id: u32 },
    #[error("Instance name '{name}' contains whitespace")]
    InvalidName { name: String },
    #[error("Instance {id} must have at least one CPU core")]
    NoCores { id: u32 },
    #[error("Instance {id} must have some memory")]
    NoMemory { id: u32 },
    #[error("Instance id {id} is used more than once")]
    DuplicateId { id: u32 },
}

impl InstanceDescriptor {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cores: CORES_DEFAULT,
            memory: MEMORY_MIB_DEFAULT,
            bridges: Vec::new(),
            config_disk: None,
            image_version: None,
            start: false,
            onboot: true,
        }
    }

    /// TCP port of the telnet-accessible serial console, `None` if it would
    /// not fit in a port number.
    pub fn console_port(&self, base: u16) -> Option<u16> {
        u16::try_from(self.id)
            .ok()
            .and_then(|id| base.checked_add(id))
    }

    pub fn validate(&self, console_port_base: u16) -> Result<(), InstanceValidationError> {
        if self.id < MIN_INSTANCE_ID {
            return Err(InstanceValidationError::IdTooLow {
                id: self.id,
                min: MIN_INSTANCE_ID,
            });
        }

        if self.console_port(console_port_base).is_none() {
            return Err(InstanceValidationError::ConsolePortOutOfRange { id: self.id });
        }

        if self.name.is_empty() {
            return Err(InstanceValidationError::EmptyName { id: self.id });
        }

        if self.name.chars().any(char::is_whitespace) {
            return Err(InstanceValidationError::InvalidName {
                name: self.name.clone(),
            });
        }

        if self.cores == 0 {
            return Err(InstanceValidationError::NoCores { id: self.id });
        }

        if self.memory == 0 {
            return Err(InstanceValidationError::NoMemory { id: self.id });
        }

        Ok(())
    }
}

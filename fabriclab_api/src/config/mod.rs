use std::path::Path;

use log::debug;
use serde::de::DeserializeOwned;

use crate::error::{FabricError, InvalidInputError, ReportError};

mod hypervisor;
mod instance;
mod topology;

pub use hypervisor::{FailurePolicy, HypervisorConfig};
pub use instance::{InstanceDescriptor, InstanceValidationError};
pub use topology::Topology;

/// Reads a YAML document from `path` and deserializes it.
pub fn load_yaml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, FabricError> {
    let path = path.as_ref();
    debug!("Loading '{}'", path.display());
    let contents = std::fs::read_to_string(path).structured(InvalidInputError::LoadConfiguration {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&contents).structured(InvalidInputError::ParseConfiguration)
}

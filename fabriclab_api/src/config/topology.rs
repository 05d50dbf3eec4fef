use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::{InstanceDescriptor, InstanceValidationError};

/// A named set of instances provisioned together.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Topology {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub instances: Vec<InstanceDescriptor>,
}

impl Topology {
    /// Validates every instance and rejects reused identifiers.
    pub fn validate(&self, console_port_base: u16) -> Result<(), InstanceValidationError> {
        let mut seen = HashSet::new();
        for instance in &self.instances {
            instance.validate(console_port_base)?;
            if !seen.insert(instance.id) {
                return Err(InstanceValidationError::DuplicateId { id: instance.id });
            }
        }
        Ok(())
    }
}

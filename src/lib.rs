use std::path::Path;

use log::{debug, error, info};

use fabriclab_api::{
    config::{self, HypervisorConfig, InstanceDescriptor, Topology},
    constants::FABRICLAB_CONFIG_PATH,
    error::{FabricError, FabricResultExt, InternalError, InvalidInputError, ReportError},
};
use osutils::{
    dependencies::{Dependency, Executor, SystemExecutor},
    files,
    qm::InstanceState,
};

pub mod cli;
pub mod image;
pub mod instance;
mod logging;
pub mod mac;
pub mod poll;
pub mod provision;

pub use instance::InstanceManager;
pub use logging::{background_log::BackgroundLog, multilog::MultiLogger};
pub use provision::{ProvisionReport, Provisioner, TopologyOutcome};

use crate::poll::{Clock, SystemClock};

/// Fabriclab version as provided by environment variables at build time
pub const FABRICLAB_VERSION: &str = match option_env!("FABRICLAB_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Mode of the report and error files written on request.
const OUTPUT_FILE_MODE: u32 = 0o644;

/// Loads the hypervisor configuration from `path`, or from the well-known
/// location when it exists, falling back to the defaults.
pub fn load_hypervisor_config(path: Option<&Path>) -> Result<HypervisorConfig, FabricError> {
    let config: HypervisorConfig = match path {
        Some(path) => config::load_yaml_file(path)?,
        None if Path::new(FABRICLAB_CONFIG_PATH).exists() => {
            config::load_yaml_file(FABRICLAB_CONFIG_PATH)?
        }
        None => {
            debug!("No configuration at '{FABRICLAB_CONFIG_PATH}', using defaults");
            HypervisorConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

/// Loads and validates a topology file.
pub fn load_topology(
    path: &Path,
    config: &HypervisorConfig,
) -> Result<Topology, FabricError> {
    let topology: Topology = config::load_yaml_file(path)?;
    topology
        .validate(config.console_port_base)
        .map_err(|e| FabricError::new(InvalidInputError::from(e)))
        .message(format!("Topology '{}' is invalid", path.display()))?;
    Ok(topology)
}

/// Writes `value` as YAML to `path`.
pub fn write_yaml<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), FabricError> {
    let contents = serde_yaml::to_string(value)
        .structured(InternalError::Internal("Failed to serialize output"))?;
    files::write_file(path, OUTPUT_FILE_MODE, contents.as_bytes()).structured(
        InternalError::Internal("Failed to write output file"),
    )
}

/// Entry point of every fabriclab operation against one hypervisor.
pub struct Fabriclab {
    config: HypervisorConfig,
    executor: Box<dyn Executor>,
    clock: Box<dyn Clock>,
}

impl Fabriclab {
    /// Drives the local hypervisor.
    pub fn new(config: HypervisorConfig) -> Self {
        Self::with_backends(config, Box::new(SystemExecutor), Box::new(SystemClock))
    }

    pub fn with_backends(
        config: HypervisorConfig,
        executor: Box<dyn Executor>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            config,
            executor,
            clock,
        }
    }

    fn provisioner(&self) -> Provisioner<'_> {
        Provisioner::new(&self.config, self.executor.as_ref(), self.clock.as_ref())
    }

    fn manager(&self) -> InstanceManager<'_> {
        InstanceManager::new(&self.config, self.executor.as_ref(), self.clock.as_ref())
    }

    /// Checks that the host can be provisioned on at all.
    pub fn check_environment(&self) -> Result<(), FabricError> {
        self.config.validate_environment()?;
        Dependency::Qm
            .path()
            .map_err(|e| FabricError::from(*e))
            .message("The hypervisor management CLI is not available")?;
        Ok(())
    }

    /// Provisions one instance.
    pub fn create(&self, descriptor: &InstanceDescriptor) -> Result<ProvisionReport, FabricError> {
        self.check_environment()?;
        self.provisioner().provision(descriptor)
    }

    /// Provisions every instance of the topology at `path`. Fails if any
    /// instance could not be provisioned, after trying all of them.
    pub fn apply(
        &self,
        path: &Path,
        version: Option<&str>,
        start: bool,
    ) -> Result<Vec<ProvisionReport>, FabricError> {
        let mut topology = load_topology(path, &self.config)?;
        for descriptor in topology.instances.iter_mut() {
            if descriptor.image_version.is_none() {
                descriptor.image_version = version.map(str::to_string);
            }
            descriptor.start |= start;
        }

        self.check_environment()?;
        let outcome = self.provisioner().provision_all(&topology);
        for (name, e) in &outcome.failed {
            debug!("Instance '{name}' failed: {e:?}");
        }

        if outcome.failed.is_empty() {
            return Ok(outcome.provisioned);
        }

        error!("Failed to create: {}", outcome.failed_names().join(", "));
        let failed = outcome.failed.len();
        let (name, first_error) = outcome
            .failed
            .into_iter()
            .next()
            .structured(InternalError::Internal("Missing failed instance"))?;
        Err(first_error).message(format!(
            "Failed to provision {failed} instance(s), starting with '{name}'"
        ))
    }

    pub fn start(&self, id: u32) -> Result<(), FabricError> {
        self.manager().start(id)
    }

    pub fn stop(&self, id: u32) -> Result<(), FabricError> {
        self.manager().stop(id)
    }

    pub fn destroy(&self, id: u32, purge: bool) -> Result<(), FabricError> {
        self.manager().destroy(id, purge)
    }

    pub fn status(&self, id: u32) -> Result<Option<InstanceState>, FabricError> {
        self.manager().status(id)
    }
}

/// Builds a descriptor from command line arguments.
#[allow(clippy::too_many_arguments)]
pub fn descriptor_from_args(
    id: u32,
    name: &str,
    version: Option<&str>,
    cores: u32,
    memory: u32,
    bridges: &[String],
    config_disk: Option<&Path>,
    start: bool,
) -> InstanceDescriptor {
    let descriptor = InstanceDescriptor {
        cores,
        memory,
        bridges: bridges.to_vec(),
        config_disk: config_disk.map(Path::to_path_buf),
        image_version: version.map(str::to_string),
        start,
        ..InstanceDescriptor::new(id, name)
    };
    info!(
        "Instance {} ({}): {} core(s), {} MiB",
        descriptor.id, descriptor.name, descriptor.cores, descriptor.memory
    );
    descriptor
}

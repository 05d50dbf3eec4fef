use std::time::Duration;

use log::{debug, info};

use fabriclab_api::{
    config::HypervisorConfig,
    error::{FabricError, InvalidInputError},
};
use osutils::{
    dependencies::{DependencyResultExt, Executor},
    qm::{self, InstanceState},
};

use crate::poll::Clock;

/// Time given to a stopped instance to release its resources before it is
/// destroyed.
const STOP_SETTLE_TIME: Duration = Duration::from_secs(2);

/// Returns true if the hypervisor already has a descriptor for instance `id`.
///
/// The check is not atomic with a later create: two concurrent callers may
/// both see `false` for the same id.
pub fn instance_exists(config: &HypervisorConfig, id: u32) -> bool {
    let path = config.instance_config_path(id);
    let exists = path.exists();
    debug!(
        "Descriptor '{}' {}",
        path.display(),
        if exists { "exists" } else { "does not exist" }
    );
    exists
}

/// Day-two operations on already provisioned instances.
pub struct InstanceManager<'a> {
    config: &'a HypervisorConfig,
    executor: &'a dyn Executor,
    clock: &'a dyn Clock,
}

impl<'a> InstanceManager<'a> {
    pub fn new(
        config: &'a HypervisorConfig,
        executor: &'a dyn Executor,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            config,
            executor,
            clock,
        }
    }

    fn ensure_exists(&self, id: u32) -> Result<(), FabricError> {
        if !instance_exists(self.config, id) {
            return Err(FabricError::new(InvalidInputError::InstanceNotFound { id }));
        }
        Ok(())
    }

    /// Run state of instance `id`, `None` if the hypervisor does not know it.
    pub fn status(&self, id: u32) -> Result<Option<InstanceState>, FabricError> {
        qm::status(self.executor, id).message(format!("Failed to query status of instance {id}"))
    }

    pub fn start(&self, id: u32) -> Result<(), FabricError> {
        self.ensure_exists(id)?;
        info!("Starting instance {id}");
        qm::start(self.executor, id).message(format!("Failed to start instance {id}"))
    }

    pub fn stop(&self, id: u32) -> Result<(), FabricError> {
        self.ensure_exists(id)?;
        info!("Stopping instance {id}");
        qm::stop(self.executor, id).message(format!("Failed to stop instance {id}"))
    }

    /// Destroys instance `id`, stopping it first if it is running. With
    /// `purge`, its disks and every reference to it are removed as well.
    pub fn destroy(&self, id: u32, purge: bool) -> Result<(), FabricError> {
        self.ensure_exists(id)?;

        if self.status(id)? == Some(InstanceState::Running) {
            info!("Instance {id} is running, stopping it first");
            qm::stop(self.executor, id).message(format!("Failed to stop instance {id}"))?;
            self.clock.sleep(STOP_SETTLE_TIME);
        }

        info!("Destroying instance {id}");
        qm::destroy(self.executor, id, purge).message(format!("Failed to destroy instance {id}"))
    }
}

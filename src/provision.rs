//! The provisioning pipeline: turns an [`InstanceDescriptor`] into a booted
//! (or bootable) instance on the hypervisor.
//!
//! Steps run strictly in order and each one aborts the run on failure, with
//! the exception of the configuration disk, which is attached on a best
//! effort basis. Nothing that was already applied is reverted unless the
//! hypervisor configuration asks for [`FailurePolicy::Destroy`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, IntoStaticStr};

use fabriclab_api::{
    config::{
        FailurePolicy, HypervisorConfig, InstanceDescriptor, InstanceValidationError, Topology,
    },
    error::{FabricError, FabricResultExt, InvalidInputError, ProvisioningError, ReportError},
    primitives::DiskReference,
};
use osutils::{
    dependencies::{DependencyResultExt, Executor},
    qm::{self, CreateOptions, CONFIG_DISK_SLOT},
};

use crate::{
    image, instance,
    mac::random_mac,
    poll::{self, Clock},
};

/// The steps of a provisioning run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Step {
    Validate,
    Guard,
    ResolveImage,
    Create,
    ImportDisk,
    WaitForImport,
    AttachPrimaryDisk,
    SetBootOrder,
    AttachNetwork,
    AttachConfigDisk,
    Start,
}

/// A network interface attached to a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkInterface {
    pub index: usize,
    pub mac: String,
    pub bridge: String,
}

/// What happened to the optional configuration disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum ConfigDiskOutcome {
    NotRequested,
    Attached { disk: DiskReference },
    Skipped { reason: String },
}

/// Summary of a successful provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisionReport {
    pub id: u32,
    pub name: String,
    pub image: PathBuf,
    pub console_port: u16,
    pub primary_disk: DiskReference,
    pub interfaces: Vec<NetworkInterface>,
    pub config_disk: ConfigDiskOutcome,
    pub started: bool,
    pub created_at: DateTime<Utc>,
}

/// Outcome of provisioning every instance of a topology.
#[derive(Debug, Default)]
pub struct TopologyOutcome {
    pub provisioned: Vec<ProvisionReport>,
    pub failed: Vec<(String, FabricError)>,
}

impl TopologyOutcome {
    pub fn failed_names(&self) -> Vec<&str> {
        self.failed.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// State of a single provisioning run.
#[derive(Debug)]
struct PipelineRun {
    step: Step,
    /// Set once the hypervisor has accepted the create request.
    created: bool,
    primary_disk: Option<DiskReference>,
}

impl PipelineRun {
    fn new() -> Self {
        Self {
            step: Step::Validate,
            created: false,
            primary_disk: None,
        }
    }

    fn enter(&mut self, step: Step) -> Step {
        debug!("Entering step '{step}'");
        self.step = step;
        step
    }
}

pub struct Provisioner<'a> {
    config: &'a HypervisorConfig,
    executor: &'a dyn Executor,
    clock: &'a dyn Clock,
}

impl<'a> Provisioner<'a> {
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

    /// Provisions the instance described by `descriptor`.
    pub fn provision(&self, descriptor: &InstanceDescriptor) -> Result<ProvisionReport, FabricError> {
        info!(
            "Provisioning instance {} ({})",
            descriptor.id, descriptor.name
        );

        let mut run = PipelineRun::new();
        let result = self.run_pipeline(descriptor, &mut run);

        if let Err(e) = &result {
            error!(
                "Provisioning of instance {} failed in step '{}': {}",
                descriptor.id,
                run.step,
                e.kind()
            );
            if let Some(disk) = &run.primary_disk {
                debug!("Primary disk '{disk}' was discovered before the failure");
            }
            self.handle_failure(descriptor.id, &run);
        }

        result
    }

    /// Provisions every instance of `topology` one after the other, carrying
    /// on after failed instances.
    pub fn provision_all(&self, topology: &Topology) -> TopologyOutcome {
        if let Some(description) = &topology.description {
            info!("Provisioning topology: {description}");
        }

        let mut outcome = TopologyOutcome::default();
        for descriptor in &topology.instances {
            match self.provision(descriptor) {
                Ok(report) => outcome.provisioned.push(report),
                Err(e) => outcome.failed.push((descriptor.name.clone(), e)),
            }
        }

        info!(
            "Provisioned {} of {} instance(s)",
            outcome.provisioned.len(),
            topology.instances.len()
        );
        outcome
    }

    fn handle_failure(&self, id: u32, run: &PipelineRun) {
        if !run.created {
            return;
        }

        match self.config.on_failure {
            FailurePolicy::Leave => {
                warn!("Instance {id} was left in place, destroy it with 'qm destroy {id} --purge'");
            }
            FailurePolicy::Destroy => {
                warn!("Destroying partially provisioned instance {id}");
                if let Err(e) = qm::destroy(self.executor, id, true) {
                    warn!("Failed to clean up instance {id}: {e}");
                }
            }
        }
    }

    fn run_pipeline(
        &self,
        descriptor: &InstanceDescriptor,
        run: &mut PipelineRun,
    ) -> Result<ProvisionReport, FabricError> {
        let id = descriptor.id;

        let step = run.enter(Step::Validate);
        descriptor
            .validate(self.config.console_port_base)
            .map_err(|e| FabricError::new(InvalidInputError::from(e)))
            .message(format!("Step '{step}' failed"))?;
        let console_port = descriptor
            .console_port(self.config.console_port_base)
            .structured(InvalidInputError::from(
                InstanceValidationError::ConsolePortOutOfRange { id },
            ))?;

        let step = run.enter(Step::Guard);
        if instance::instance_exists(self.config, id) {
            return Err(FabricError::new(InvalidInputError::AlreadyExists { id }))
                .message(format!("Step '{step}' failed"));
        }

        let step = run.enter(Step::ResolveImage);
        let image = image::resolve_image(
            &self.config.image_dir,
            &self.config.image_pattern,
            descriptor.image_version.as_deref(),
        )
        .message(format!("Step '{step}' failed"))?;

        let step = run.enter(Step::Create);
        let name = format!("{}{}", descriptor.name, self.config.name_suffix);
        info!("Creating instance {id} ({name}), console on port {console_port}");
        qm::create(
            self.executor,
            &CreateOptions {
                id,
                name: name.clone(),
                cores: descriptor.cores,
                memory: descriptor.memory,
                os_type: self.config.os_type.clone(),
                onboot: descriptor.onboot,
                extra_args: qm::extra_args(&self.config.smbios_product, console_port),
            },
        )
        .message(format!("Failed to create instance {id}"))
        .message(format!("Step '{step}' failed"))?;
        run.created = true;

        let step = run.enter(Step::ImportDisk);
        info!(
            "Importing '{}' into '{}'",
            image.display(),
            self.config.storage_pool
        );
        let import_output = qm::import_disk(self.executor, id, &image, &self.config.storage_pool)
            .message(format!("Failed to import disk of instance {id}"))
            .message(format!("Step '{step}' failed"))?;
        debug!("Disk import output:\n{import_output}");

        let step = run.enter(Step::WaitForImport);
        info!(
            "Waiting up to {}s for the disk import to complete",
            self.config.import_timeout_secs
        );
        let imported = poll::wait_until(
            self.clock,
            self.config.import_poll_interval(),
            self.config.import_timeout(),
            || match qm::config(self.executor, id) {
                Ok(config) => qm::import_materialized(&config, id),
                Err(e) => {
                    debug!("Failed to read configuration of instance {id}: {e}");
                    false
                }
            },
        );
        if !imported {
            return Err(FabricError::new(ProvisioningError::ImportTimeout {
                id,
                timeout_secs: self.config.import_timeout_secs,
            }))
            .message(format!("Step '{step}' failed"));
        }

        let step = run.enter(Step::AttachPrimaryDisk);
        let disk = self
            .discover_primary_disk(id)
            .message(format!("Step '{step}' failed"))?;
        info!("Attaching primary disk '{disk}'");
        qm::attach_primary_disk(self.executor, id, &disk)
            .message(format!("Failed to attach disk '{disk}' to instance {id}"))
            .message(format!("Step '{step}' failed"))?;
        run.primary_disk = Some(disk.clone());

        let step = run.enter(Step::SetBootOrder);
        qm::set_boot_order(self.executor, id)
            .message(format!("Failed to set boot order of instance {id}"))
            .message(format!("Step '{step}' failed"))?;

        let step = run.enter(Step::AttachNetwork);
        let interfaces = self
            .attach_network(descriptor)
            .message(format!("Step '{step}' failed"))?;

        run.enter(Step::AttachConfigDisk);
        let config_disk = match &descriptor.config_disk {
            None => ConfigDiskOutcome::NotRequested,
            Some(path) => self.attach_config_disk_best_effort(id, path),
        };

        let started = descriptor.start && self.start_best_effort(run, id);

        info!("Instance {id} ({name}) provisioned, console: telnet <host> {console_port}");
        Ok(ProvisionReport {
            id,
            name,
            image,
            console_port,
            primary_disk: disk,
            interfaces,
            config_disk,
            started,
            created_at: Utc::now(),
        })
    }

    fn discover_primary_disk(&self, id: u32) -> Result<DiskReference, FabricError> {
        let config = qm::config(self.executor, id)
            .message(format!("Failed to read configuration of instance {id}"))?;
        qm::find_unused_disk(&config, id).structured(ProvisioningError::DiskDiscovery { id })
    }

    fn attach_network(
        &self,
        descriptor: &InstanceDescriptor,
    ) -> Result<Vec<NetworkInterface>, FabricError> {
        let id = descriptor.id;
        let mut bridges = if descriptor.bridges.is_empty() {
            self.config.default_bridges.clone()
        } else {
            descriptor.bridges.clone()
        };
        if bridges.len() > self.config.max_network_interfaces {
            warn!(
                "Instance {id} lists {} bridges, only the first {} are attached",
                bridges.len(),
                self.config.max_network_interfaces
            );
            bridges.truncate(self.config.max_network_interfaces);
        }

        let mut interfaces = Vec::with_capacity(bridges.len());
        for (index, bridge) in bridges.into_iter().enumerate() {
            let mac = random_mac();
            info!("Attaching net{index} ({mac}) to bridge '{bridge}'");
            qm::attach_network(self.executor, id, index, &mac, &bridge)
                .message(format!("Failed to attach net{index} of instance {id}"))?;
            interfaces.push(NetworkInterface { index, mac, bridge });
        }

        Ok(interfaces)
    }

    fn attach_config_disk_best_effort(&self, id: u32, path: &Path) -> ConfigDiskOutcome {
        if !path.exists() {
            warn!(
                "Configuration disk '{}' does not exist, skipping it",
                path.display()
            );
            return ConfigDiskOutcome::Skipped {
                reason: format!("'{}' does not exist", path.display()),
            };
        }

        match self.attach_config_disk(id, path) {
            Ok(disk) => ConfigDiskOutcome::Attached { disk },
            Err(e) => {
                warn!("Failed to attach configuration disk to instance {id}: {e:?}");
                warn!(
                    "Attach it manually with:\n  {}\n  qm set {id} --{CONFIG_DISK_SLOT} {}:<volume>,size={}",
                    qm::import_disk_cmd(id, path, &self.config.storage_pool).render_command(),
                    self.config.storage_pool,
                    self.config.config_disk_size,
                );
                ConfigDiskOutcome::Skipped {
                    reason: e.kind().to_string(),
                }
            }
        }
    }

    fn attach_config_disk(&self, id: u32, path: &Path) -> Result<DiskReference, FabricError> {
        info!("Importing configuration disk '{}'", path.display());
        let output = qm::import_disk(self.executor, id, path, &self.config.storage_pool)
            .message("Failed to import configuration disk")?;
        let disk = qm::parse_imported_disk(&output)
            .structured(ProvisioningError::DiskDiscovery { id })
            .message("Import output does not name the new disk")?;

        info!("Attaching configuration disk '{disk}'");
        qm::attach_config_disk(self.executor, id, &disk, &self.config.config_disk_size)
            .message(format!("Failed to attach configuration disk '{disk}'"))?;
        Ok(disk)
    }

    fn start_best_effort(&self, run: &mut PipelineRun, id: u32) -> bool {
        run.enter(Step::Start);
        info!("Starting instance {id}");
        match qm::start(self.executor, id) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to start instance {id}, start it with 'qm start {id}': {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use indoc::indoc;
    use strum::IntoEnumIterator;
    use tempfile::TempDir;

    use fabriclab_api::error::{ErrorKind, ImageNotFoundError};
    use osutils::testutils::{FakeExecutor, FakeResponse};

    use crate::poll::test_clock::ManualClock;

    use super::*;

    const IMAGE_NAME: &str = "vJunos-switch-25.4R1.12.qcow2";

    const IMPORTED_CONFIG: &str = indoc! {"
        boot: order=net0
        cores: 4
        cpu: host
        memory: 8192
        name: spine-1.switch
        numa: 1
        onboot: 1
        ostype: l26
        scsihw: virtio-scsi-single
        unused0: local-lvm:vm-201-disk-0
    "};

    const PENDING_CONFIG: &str = indoc! {"
        boot: order=net0
        cores: 4
        memory: 8192
        name: spine-1.switch
    "};

    struct TestHost {
        dir: TempDir,
        config: HypervisorConfig,
    }

    impl TestHost {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let image_dir = dir.path().join("qcow");
            let instance_config_dir = dir.path().join("qemu-server");
            fs::create_dir(&image_dir).unwrap();
            fs::create_dir(&instance_config_dir).unwrap();
            fs::write(image_dir.join(IMAGE_NAME), "").unwrap();

            let config = HypervisorConfig {
                image_dir,
                instance_config_dir,
                ..Default::default()
            };
            Self { dir, config }
        }

        fn image(&self) -> PathBuf {
            self.config.image_dir.join(IMAGE_NAME)
        }

        fn image_import_prefix(&self) -> String {
            format!("qm disk import 201 {}", self.image().display())
        }

        /// Executor for which every step of a run for instance 201 succeeds.
        fn executor(&self) -> FakeExecutor {
            FakeExecutor::new()
                .on(
                    self.image_import_prefix(),
                    FakeResponse::ok(
                        "transferred 32.0 GiB of 32.0 GiB (100.00%)\n\
                         Successfully imported disk as 'unused0:local-lvm:vm-201-disk-0'\n",
                    ),
                )
                .on("qm config 201", FakeResponse::ok(IMPORTED_CONFIG))
        }

        fn config_disk(&self) -> PathBuf {
            let path = self.dir.path().join("spine-1-config.img");
            fs::write(&path, "").unwrap();
            path
        }
    }

    fn spine_1() -> InstanceDescriptor {
        InstanceDescriptor {
            bridges: vec!["vmbr101".into(), "vmbr500".into(), "vmbr500".into()],
            ..InstanceDescriptor::new(201, "spine-1")
        }
    }

    fn assert_mac(mac: &str) {
        let octets = mac
            .split(':')
            .map(|octet| u8::from_str_radix(octet, 16).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(octets.len(), 6, "Invalid MAC address '{mac}'");
        assert_eq!(octets[0] & 1, 0, "MAC address '{mac}' is not unicast");
    }

    #[test]
    fn test_provision() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner.provision(&spine_1()).unwrap();

        assert_eq!(report.id, 201);
        assert_eq!(report.name, "spine-1.switch");
        assert_eq!(report.image, host.image());
        assert_eq!(report.console_port, 5201);
        assert_eq!(
            report.primary_disk,
            DiskReference::new("local-lvm", "vm-201-disk-0")
        );
        assert_eq!(report.config_disk, ConfigDiskOutcome::NotRequested);
        assert!(!report.started);
        assert_eq!(
            report
                .interfaces
                .iter()
                .map(|interface| (interface.index, interface.bridge.as_str()))
                .collect::<Vec<_>>(),
            vec![(0, "vmbr101"), (1, "vmbr500"), (2, "vmbr500")]
        );
        report
            .interfaces
            .iter()
            .for_each(|interface| assert_mac(&interface.mac));

        let calls = executor.calls();
        assert_eq!(calls.len(), 9, "Unexpected calls: {calls:#?}");
        assert!(calls[0].starts_with("qm create 201 --name spine-1.switch --cores 4 --memory 8192"));
        assert!(calls[0].contains("port=5201"));
        assert!(calls[0].contains("product=VM-VEX"));
        assert_eq!(
            calls[1],
            format!("{} local-lvm --format raw", host.image_import_prefix())
        );
        assert_eq!(calls[2], "qm config 201");
        assert_eq!(calls[3], "qm config 201");
        assert_eq!(
            calls[4],
            "qm set 201 --virtio0 local-lvm:vm-201-disk-0,iothread=1"
        );
        assert_eq!(calls[5], "qm set 201 --boot order=virtio0");
        for (index, interface) in report.interfaces.iter().enumerate() {
            assert_eq!(
                calls[6 + index],
                format!(
                    "qm set 201 --net{index} virtio={},bridge={}",
                    interface.mac, interface.bridge
                )
            );
        }
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_provision_import_timeout() {
        let host = TestHost::new();
        let executor = FakeExecutor::new()
            .on(host.image_import_prefix(), FakeResponse::ok(""))
            .on("qm config 201", FakeResponse::ok(PENDING_CONFIG));
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner.provision(&spine_1()).unwrap_err();

        assert_eq!(
            error.kind(),
            &ErrorKind::Provisioning(ProvisioningError::ImportTimeout {
                id: 201,
                timeout_secs: 180
            })
        );
        assert!(format!("{error:?}").contains("Step 'wait-for-import' failed"));
        assert_eq!(clock.elapsed(), Duration::from_secs(180));
        // Checked every 3 seconds from 0 to 180 inclusive.
        assert_eq!(executor.calls_matching("qm config 201").len(), 61);
        assert!(executor.calls_matching("qm set").is_empty());
        assert!(executor.calls_matching("qm destroy").is_empty());
    }

    #[test]
    fn test_provision_import_completes_late() {
        let host = TestHost::new();
        let executor = FakeExecutor::new()
            .on(host.image_import_prefix(), FakeResponse::ok(""))
            .on("qm config 201", FakeResponse::ok(PENDING_CONFIG))
            .on("qm config 201", FakeResponse::ok(PENDING_CONFIG))
            .on("qm config 201", FakeResponse::ok(IMPORTED_CONFIG));
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        provisioner.provision(&spine_1()).unwrap();
        assert_eq!(clock.elapsed(), Duration::from_secs(6));
    }

    #[test]
    fn test_provision_config_disk_failure() {
        let host = TestHost::new();
        let config_disk = host.config_disk();
        let executor = host.executor().on(
            format!("qm disk import 201 {}", config_disk.display()),
            FakeResponse::fail(255, "unable to parse volume filename"),
        );
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                config_disk: Some(config_disk),
                ..spine_1()
            })
            .unwrap();

        let ConfigDiskOutcome::Skipped { reason } = &report.config_disk else {
            panic!("Unexpected outcome: {:?}", report.config_disk);
        };
        assert!(reason.contains("exited with status: 255"), "{reason}");
        assert!(executor.calls_matching("qm set 201 --ide0").is_empty());
        assert_eq!(executor.calls_matching("qm set 201 --net").len(), 3);
    }

    #[test]
    fn test_provision_config_disk_unparsable() {
        let host = TestHost::new();
        let config_disk = host.config_disk();
        let executor = host.executor().on(
            format!("qm disk import 201 {}", config_disk.display()),
            FakeResponse::ok("importing disk...\n"),
        );
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                config_disk: Some(config_disk),
                ..spine_1()
            })
            .unwrap();

        assert!(matches!(
            report.config_disk,
            ConfigDiskOutcome::Skipped { .. }
        ));
        assert!(executor.calls_matching("qm set 201 --ide0").is_empty());
    }

    #[test]
    fn test_provision_config_disk() {
        let host = TestHost::new();
        let config_disk = host.config_disk();
        let executor = host.executor().on(
            format!("qm disk import 201 {}", config_disk.display()),
            FakeResponse::ok("Successfully imported disk as 'unused1:local-lvm:vm-201-disk-1'\n"),
        );
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                config_disk: Some(config_disk),
                ..spine_1()
            })
            .unwrap();

        assert_eq!(
            report.config_disk,
            ConfigDiskOutcome::Attached {
                disk: DiskReference::new("local-lvm", "vm-201-disk-1")
            }
        );
        assert_eq!(
            executor.calls().last().unwrap(),
            "qm set 201 --ide0 local-lvm:vm-201-disk-1,size=16M"
        );
    }

    #[test]
    fn test_provision_missing_config_disk() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                config_disk: Some(host.dir.path().join("missing.img")),
                ..spine_1()
            })
            .unwrap();

        assert!(matches!(
            report.config_disk,
            ConfigDiskOutcome::Skipped { .. }
        ));
        assert_eq!(executor.calls_matching("qm disk import").len(), 1);
    }

    #[test]
    fn test_provision_already_exists() {
        let host = TestHost::new();
        fs::write(host.config.instance_config_path(201), PENDING_CONFIG).unwrap();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner.provision(&spine_1()).unwrap_err();

        assert_eq!(
            error.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::AlreadyExists { id: 201 })
        );
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_provision_invalid_descriptor() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner
            .provision(&InstanceDescriptor::new(42, "spine-1"))
            .unwrap_err();

        assert_eq!(
            error.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::InvalidInstance(
                InstanceValidationError::IdTooLow { id: 42, min: 100 }
            ))
        );
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_provision_version_not_found() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner
            .provision(&InstanceDescriptor {
                image_version: Some("23.2R1.14".into()),
                ..spine_1()
            })
            .unwrap_err();

        assert_eq!(
            error.kind(),
            &ErrorKind::ImageNotFound(ImageNotFoundError::VersionNotFound {
                version: "23.2R1.14".into(),
                available: vec![IMAGE_NAME.into()],
            })
        );
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_provision_create_failure() {
        let host = TestHost::new();
        let executor = host.executor().on(
            "qm create 201",
            FakeResponse::fail(255, "unable to create VM 201 - VM 201 already exists on node 'pve2'"),
        );
        let clock = ManualClock::new();
        let host_config = HypervisorConfig {
            on_failure: FailurePolicy::Destroy,
            ..host.config.clone()
        };
        let provisioner = Provisioner::new(&host_config, &executor, &clock);

        let error = provisioner.provision(&spine_1()).unwrap_err();

        assert!(matches!(
            error.kind(),
            ErrorKind::Provisioning(ProvisioningError::CommandFailed { binary, .. }) if binary == "qm"
        ));
        // Nothing was created, so there is nothing to clean up.
        assert_eq!(executor.calls().len(), 1);
    }

    #[test]
    fn test_provision_disk_discovery_failure() {
        let host = TestHost::new();
        let executor = FakeExecutor::new()
            .on(host.image_import_prefix(), FakeResponse::ok(""))
            .on(
                "qm config 201",
                FakeResponse::ok("name: spine-1.switch\nscsi0: local-lvm:vm-201-disk-0,size=32G\n"),
            );
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner.provision(&spine_1()).unwrap_err();

        assert_eq!(
            error.kind(),
            &ErrorKind::Provisioning(ProvisioningError::DiskDiscovery { id: 201 })
        );
        assert!(format!("{error:?}").contains("Step 'attach-primary-disk' failed"));
        assert!(executor.calls_matching("qm set").is_empty());
    }

    #[test]
    fn test_provision_network_failure() {
        let host = TestHost::new();
        let executor = host
            .executor()
            .on("qm set 201 --net1", FakeResponse::fail(2, "bridge 'vmbr500' does not exist"));
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let error = provisioner.provision(&spine_1()).unwrap_err();

        assert!(matches!(
            error.kind(),
            ErrorKind::Provisioning(ProvisioningError::CommandFailed { .. })
        ));
        assert!(format!("{error:?}").contains("Step 'attach-network' failed"));
        assert_eq!(executor.calls_matching("qm set 201 --net").len(), 2);
        assert!(executor.calls_matching("qm destroy").is_empty());
    }

    #[test]
    fn test_provision_network_failure_destroy() {
        let host = TestHost::new();
        let executor = host
            .executor()
            .on("qm set 201 --net1", FakeResponse::fail(2, "bridge 'vmbr500' does not exist"));
        let clock = ManualClock::new();
        let host_config = HypervisorConfig {
            on_failure: FailurePolicy::Destroy,
            ..host.config.clone()
        };
        let provisioner = Provisioner::new(&host_config, &executor, &clock);

        provisioner.provision(&spine_1()).unwrap_err();

        assert_eq!(
            executor.calls().last().unwrap(),
            "qm destroy 201 --purge"
        );
    }

    #[test]
    fn test_provision_default_bridges() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor::new(201, "spine-1"))
            .unwrap();
        assert_eq!(
            report
                .interfaces
                .iter()
                .map(|interface| interface.bridge.as_str())
                .collect::<Vec<_>>(),
            vec!["vmbr101", "vmbr500", "vmbr500", "vmbr500", "vmbr500"]
        );
    }

    #[test]
    fn test_provision_too_many_bridges() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                bridges: (0..7).map(|i| format!("vmbr{}", 600 + i)).collect(),
                ..spine_1()
            })
            .unwrap();
        assert_eq!(report.interfaces.len(), 5);
        assert_eq!(report.interfaces[4].bridge, "vmbr604");
        assert!(executor.calls_matching("qm set 201 --net5").is_empty());
    }

    #[test]
    fn test_provision_start() {
        let host = TestHost::new();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let report = provisioner
            .provision(&InstanceDescriptor {
                start: true,
                ..spine_1()
            })
            .unwrap();
        assert!(report.started);
        assert_eq!(executor.calls().last().unwrap(), "qm start 201");

        let host = TestHost::new();
        let executor = host
            .executor()
            .on("qm start 201", FakeResponse::fail(255, "start failed"));
        let provisioner = Provisioner::new(&host.config, &executor, &clock);
        let report = provisioner
            .provision(&InstanceDescriptor {
                start: true,
                ..spine_1()
            })
            .unwrap();
        assert!(!report.started);
    }

    #[test]
    fn test_provision_all() {
        let host = TestHost::new();
        fs::write(host.config.instance_config_path(202), PENDING_CONFIG).unwrap();
        let executor = host.executor();
        let clock = ManualClock::new();
        let provisioner = Provisioner::new(&host.config, &executor, &clock);

        let outcome = provisioner.provision_all(&Topology {
            description: Some("Two spines".into()),
            instances: vec![spine_1(), InstanceDescriptor::new(202, "spine-2")],
        });

        assert_eq!(outcome.provisioned.len(), 1);
        assert_eq!(outcome.provisioned[0].id, 201);
        assert_eq!(outcome.failed_names(), vec!["spine-2"]);
        assert_eq!(
            outcome.failed[0].1.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::AlreadyExists { id: 202 })
        );
    }

    #[test]
    fn test_report_serialization() {
        let report = ProvisionReport {
            id: 201,
            name: "spine-1.switch".into(),
            image: "/var/lib/vz/template/qcow/vJunos-switch-25.4R1.12.qcow2".into(),
            console_port: 5201,
            primary_disk: DiskReference::new("local-lvm", "vm-201-disk-0"),
            interfaces: vec![NetworkInterface {
                index: 0,
                mac: "02:11:22:33:44:55".into(),
                bridge: "vmbr101".into(),
            }],
            config_disk: ConfigDiskOutcome::Skipped {
                reason: "missing".into(),
            },
            started: false,
            created_at: DateTime::from_timestamp(1_760_000_000, 0).unwrap(),
        };

        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("local-lvm:vm-201-disk-0"));
        assert!(yaml.contains("outcome: skipped"));
        assert!(yaml.contains("console-port: 5201"));
        let parsed: ProvisionReport = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_step_names() {
        assert_eq!(
            Step::iter().map(|step| step.to_string()).collect::<Vec<_>>(),
            vec![
                "validate",
                "guard",
                "resolve-image",
                "create",
                "import-disk",
                "wait-for-import",
                "attach-primary-disk",
                "set-boot-order",
                "attach-network",
                "attach-config-disk",
                "start",
            ]
        );
        assert_eq!(<&str>::from(Step::AttachConfigDisk), "attach-config-disk");
    }
}

//! Typed wrappers around the `qm` hypervisor management CLI, plus the parsers
//! that recover resource identifiers from its free-form output.

use std::{fmt, path::Path};

use once_cell::sync::Lazy;
use regex::Regex;

use fabriclab_api::primitives::DiskReference;

use crate::dependencies::{Command, Dependency, DependencyError, Executor};

/// Slot the primary disk is attached to.
pub const PRIMARY_DISK_SLOT: &str = "virtio0";

/// Slot the configuration disk is attached to.
pub const CONFIG_DISK_SLOT: &str = "ide0";

/// Format every disk is imported as.
const IMPORT_FORMAT: &str = "raw";

/// Matches `unused<N>:<pool>:<volume>`, with or without a space after the
/// first colon, as printed by `qm disk import` and `qm config`.
static UNUSED_DISK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"unused\d+:\s*([\w.-]+):([\w./-]+)").unwrap());

/// Arguments of `qm create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub id: u32,
    pub name: String,
    pub cores: u32,
    /// Memory in MiB.
    pub memory: u32,
    pub os_type: String,
    pub onboot: bool,
    /// Raw QEMU arguments appended by the hypervisor.
    pub extra_args: String,
}

/// Run state reported by `qm status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    Stopped,
    Paused,
    Other(String),
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Running => f.write_str("running"),
            InstanceState::Stopped => f.write_str("stopped"),
            InstanceState::Paused => f.write_str("paused"),
            InstanceState::Other(state) => f.write_str(state),
        }
    }
}

/// Builds the QEMU arguments tagging the guest with an SMBIOS product and
/// exposing its first serial port as a telnet server on `console_port`.
pub fn extra_args(smbios_product: &str, console_port: u16) -> String {
    format!(
        "-smbios type=1,product={smbios_product} \
         -chardev socket,id=serial0,port={console_port},host=0.0.0.0,server=on,wait=off,telnet=on \
         -device isa-serial,chardev=serial0"
    )
}

pub fn create_cmd(options: &CreateOptions) -> Command {
    Dependency::Qm.cmd().with_args([
        "create".to_string(),
        options.id.to_string(),
        "--name".into(),
        options.name.clone(),
        "--cores".into(),
        options.cores.to_string(),
        "--memory".into(),
        options.memory.to_string(),
        "--cpu".into(),
        "host".into(),
        "--ostype".into(),
        options.os_type.clone(),
        "--scsihw".into(),
        "virtio-scsi-single".into(),
        "--numa".into(),
        "1".into(),
        "--onboot".into(),
        if options.onboot { "1" } else { "0" }.into(),
        "--args".into(),
        options.extra_args.clone(),
    ])
}

pub fn import_disk_cmd(id: u32, image: &Path, pool: &str) -> Command {
    Dependency::Qm
        .cmd()
        .with_args(["disk", "import", id.to_string().as_str()])
        .with_arg(image)
        .with_args([pool, "--format", IMPORT_FORMAT])
}

pub fn config_cmd(id: u32) -> Command {
    Dependency::Qm.cmd().with_args(["config", id.to_string().as_str()])
}

pub fn attach_primary_disk_cmd(id: u32, disk: &DiskReference) -> Command {
    Dependency::Qm.cmd().with_args([
        "set".to_string(),
        id.to_string(),
        format!("--{PRIMARY_DISK_SLOT}"),
        format!("{disk},iothread=1"),
    ])
}

pub fn set_boot_order_cmd(id: u32) -> Command {
    Dependency::Qm.cmd().with_args([
        "set".to_string(),
        id.to_string(),
        "--boot".into(),
        format!("order={PRIMARY_DISK_SLOT}"),
    ])
}

pub fn attach_network_cmd(id: u32, index: usize, mac: &str, bridge: &str) -> Command {
    Dependency::Qm.cmd().with_args([
        "set".to_string(),
        id.to_string(),
        format!("--net{index}"),
        format!("virtio={mac},bridge={bridge}"),
    ])
}

pub fn attach_config_disk_cmd(id: u32, disk: &DiskReference, size: &str) -> Command {
    Dependency::Qm.cmd().with_args([
        "set".to_string(),
        id.to_string(),
        format!("--{CONFIG_DISK_SLOT}"),
        format!("{disk},size={size}"),
    ])
}

pub fn start_cmd(id: u32) -> Command {
    Dependency::Qm.cmd().with_args(["start", id.to_string().as_str()])
}

pub fn stop_cmd(id: u32) -> Command {
    Dependency::Qm.cmd().with_args(["stop", id.to_string().as_str()])
}

pub fn destroy_cmd(id: u32, purge: bool) -> Command {
    let mut cmd = Dependency::Qm.cmd().with_args(["destroy", id.to_string().as_str()]);
    if purge {
        cmd.arg("--purge");
    }
    cmd
}

pub fn status_cmd(id: u32) -> Command {
    Dependency::Qm.cmd().with_args(["status", id.to_string().as_str()])
}

/// Creates the instance.
pub fn create(executor: &dyn Executor, options: &CreateOptions) -> Result<(), Box<DependencyError>> {
    create_cmd(options).run_and_check(executor)
}

/// Imports `image` into `pool` and returns the command's stdout, which names
/// the new volume.
pub fn import_disk(
    executor: &dyn Executor,
    id: u32,
    image: &Path,
    pool: &str,
) -> Result<String, Box<DependencyError>> {
    import_disk_cmd(id, image, pool).output_and_check(executor)
}

/// Returns the current configuration text of the instance.
pub fn config(executor: &dyn Executor, id: u32) -> Result<String, Box<DependencyError>> {
    config_cmd(id).output_and_check(executor)
}

pub fn attach_primary_disk(
    executor: &dyn Executor,
    id: u32,
    disk: &DiskReference,
) -> Result<(), Box<DependencyError>> {
    attach_primary_disk_cmd(id, disk).run_and_check(executor)
}

pub fn set_boot_order(executor: &dyn Executor, id: u32) -> Result<(), Box<DependencyError>> {
    set_boot_order_cmd(id).run_and_check(executor)
}

pub fn attach_network(
    executor: &dyn Executor,
    id: u32,
    index: usize,
    mac: &str,
    bridge: &str,
) -> Result<(), Box<DependencyError>> {
    attach_network_cmd(id, index, mac, bridge).run_and_check(executor)
}

pub fn attach_config_disk(
    executor: &dyn Executor,
    id: u32,
    disk: &DiskReference,
    size: &str,
) -> Result<(), Box<DependencyError>> {
    attach_config_disk_cmd(id, disk, size).run_and_check(executor)
}

pub fn start(executor: &dyn Executor, id: u32) -> Result<(), Box<DependencyError>> {
    start_cmd(id).run_and_check(executor)
}

pub fn stop(executor: &dyn Executor, id: u32) -> Result<(), Box<DependencyError>> {
    stop_cmd(id).run_and_check(executor)
}

pub fn destroy(executor: &dyn Executor, id: u32, purge: bool) -> Result<(), Box<DependencyError>> {
    destroy_cmd(id, purge).run_and_check(executor)
}

/// Queries the run state of the instance. A nonzero exit, which is what `qm`
/// returns for unknown instances, yields `None`.
pub fn status(
    executor: &dyn Executor,
    id: u32,
) -> Result<Option<InstanceState>, Box<DependencyError>> {
    let output = executor.execute(&status_cmd(id))?;
    if !output.success() {
        return Ok(None);
    }
    Ok(parse_status(&output.output()))
}

/// Extracts the disk reference from the output of a disk import, e.g.
/// `Successfully imported disk as 'unused0:local-lvm:vm-201-disk-1'`.
pub fn parse_imported_disk(output: &str) -> Option<DiskReference> {
    UNUSED_DISK_REGEX
        .captures(output)
        .map(|captures| DiskReference::new(&captures[1], &captures[2]))
}

/// Looks through the configuration text of instance `id` for an unused disk
/// belonging to it, e.g. `unused0: local-lvm:vm-201-disk-0`.
pub fn find_unused_disk(config: &str, id: u32) -> Option<DiskReference> {
    let volume_prefix = volume_prefix(id);
    config
        .lines()
        .filter(|line| line.starts_with("unused") && line.contains(&volume_prefix))
        .find_map(|line| line.split_once(':')?.1.trim().parse().ok())
}

/// Returns true once the configuration text shows the result of a disk
/// import: either a volume named after the instance or any unused disk.
pub fn import_materialized(config: &str, id: u32) -> bool {
    config.contains(&volume_prefix(id)) || config.contains("unused")
}

/// Parses `status: <state>` as printed by `qm status`.
pub fn parse_status(output: &str) -> Option<InstanceState> {
    let state = output.trim().strip_prefix("status:")?.trim();
    Some(match state {
        "running" => InstanceState::Running,
        "stopped" => InstanceState::Stopped,
        "paused" => InstanceState::Paused,
        "" => return None,
        other => InstanceState::Other(other.to_string()),
    })
}

fn volume_prefix(id: u32) -> String {
    format!("vm-{id}-disk-")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use indoc::indoc;

    use crate::testutils::{FakeExecutor, FakeResponse};

    use super::*;

    #[test]
    fn test_create_cmd() {
        let options = CreateOptions {
            id: 201,
            name: "spine-1.switch".into(),
            cores: 4,
            memory: 8192,
            os_type: "l26".into(),
            onboot: true,
            extra_args: extra_args("VM-VEX", 5201),
        };
        assert_eq!(
            create_cmd(&options).render_command(),
            "qm create 201 --name spine-1.switch --cores 4 --memory 8192 --cpu host \
             --ostype l26 --scsihw virtio-scsi-single --numa 1 --onboot 1 \
             --args '-smbios type=1,product=VM-VEX -chardev socket,id=serial0,port=5201,\
             host=0.0.0.0,server=on,wait=off,telnet=on -device isa-serial,chardev=serial0'"
        );
    }

    #[test]
    fn test_commands() {
        let disk = DiskReference::new("local-lvm", "vm-201-disk-0");
        assert_eq!(
            import_disk_cmd(
                201,
                &PathBuf::from("/var/lib/vz/template/qcow/vJunos-switch-25.4R1.12.qcow2"),
                "local-lvm"
            )
            .render_command(),
            "qm disk import 201 /var/lib/vz/template/qcow/vJunos-switch-25.4R1.12.qcow2 local-lvm --format raw"
        );
        assert_eq!(config_cmd(201).render_command(), "qm config 201");
        assert_eq!(
            attach_primary_disk_cmd(201, &disk).render_command(),
            "qm set 201 --virtio0 local-lvm:vm-201-disk-0,iothread=1"
        );
        assert_eq!(
            set_boot_order_cmd(201).render_command(),
            "qm set 201 --boot order=virtio0"
        );
        assert_eq!(
            attach_network_cmd(201, 2, "02:00:00:AA:BB:CC", "vmbr500").render_command(),
            "qm set 201 --net2 virtio=02:00:00:AA:BB:CC,bridge=vmbr500"
        );
        assert_eq!(
            attach_config_disk_cmd(201, &disk, "16M").render_command(),
            "qm set 201 --ide0 local-lvm:vm-201-disk-0,size=16M"
        );
        assert_eq!(destroy_cmd(201, true).render_command(), "qm destroy 201 --purge");
        assert_eq!(destroy_cmd(201, false).render_command(), "qm destroy 201");
        assert_eq!(start_cmd(201).render_command(), "qm start 201");
        assert_eq!(stop_cmd(201).render_command(), "qm stop 201");
    }

    #[test]
    fn test_parse_imported_disk() {
        assert_eq!(
            parse_imported_disk("unused0: local-lvm:vm-201-disk-1"),
            Some(DiskReference::new("local-lvm", "vm-201-disk-1"))
        );
        assert_eq!(
            parse_imported_disk(indoc! {r#"
                importing disk '/root/config/spine-1-config.img' to VM 201 ...
                  Logical volume "vm-201-disk-1" created.
                transferred 16.0 MiB of 16.0 MiB (100.00%)
                Successfully imported disk as 'unused0:local-lvm:vm-201-disk-1'
            "#}),
            Some(DiskReference::new("local-lvm", "vm-201-disk-1"))
        );
        assert_eq!(
            parse_imported_disk("Successfully imported disk as 'unused3:local:201/vm-201-disk-3.raw'"),
            Some(DiskReference::new("local", "201/vm-201-disk-3.raw"))
        );
        assert_eq!(parse_imported_disk("virtio0: local-lvm:vm-201-disk-0"), None);
        assert_eq!(parse_imported_disk(""), None);
    }

    #[test]
    fn test_find_unused_disk() {
        let config = indoc! {r#"
            boot: order=virtio0
            cores: 4
            name: spine-1.switch
            unused0: local-lvm:vm-999-disk-0
            unused1: local-lvm:vm-201-disk-0
        "#};
        assert_eq!(
            find_unused_disk(config, 201),
            Some(DiskReference::new("local-lvm", "vm-201-disk-0"))
        );
        assert_eq!(find_unused_disk(config, 202), None);
        assert_eq!(
            find_unused_disk("virtio0: local-lvm:vm-201-disk-0,iothread=1", 201),
            None
        );
    }

    #[test]
    fn test_import_materialized() {
        assert!(!import_materialized("cores: 4\nname: spine-1.switch\n", 201));
        assert!(import_materialized("unused0: local-lvm:vm-201-disk-0\n", 201));
        assert!(import_materialized(
            "virtio0: local-lvm:vm-201-disk-0,iothread=1\n",
            201
        ));
        assert!(!import_materialized(
            "virtio0: local-lvm:vm-2010-dusk-0\n",
            201
        ));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("status: running\n"), Some(InstanceState::Running));
        assert_eq!(parse_status("status: stopped"), Some(InstanceState::Stopped));
        assert_eq!(
            parse_status("status: prelaunch\n"),
            Some(InstanceState::Other("prelaunch".into()))
        );
        assert_eq!(parse_status("garbage"), None);
        assert_eq!(parse_status("status:"), None);
    }

    #[test]
    fn test_status() {
        let executor = FakeExecutor::new()
            .on("qm status 201", FakeResponse::ok("status: running\n"))
            .on(
                "qm status 202",
                FakeResponse::fail(2, "Configuration file 'nodes/pve/qemu-server/202.conf' does not exist\n"),
            );
        assert_eq!(status(&executor, 201).unwrap(), Some(InstanceState::Running));
        assert_eq!(status(&executor, 202).unwrap(), None);
        assert_eq!(executor.calls(), vec!["qm status 201", "qm status 202"]);
    }
}

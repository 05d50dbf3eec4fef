use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use fabriclab_api::constants::{CORES_DEFAULT, MEMORY_MIB_DEFAULT};

use crate::FABRICLAB_VERSION;

#[derive(Parser, Debug)]
#[clap(version = FABRICLAB_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Hypervisor configuration file, defaults to /etc/fabriclab/config.yaml
    /// when present
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision a single virtual switch
    Create {
        /// Hypervisor id of the new instance
        #[clap(long)]
        id: u32,

        /// Name of the new instance, without the hostname suffix
        #[clap(long)]
        name: String,

        /// Image version to install instead of the newest image
        #[clap(long)]
        version: Option<String>,

        /// Number of CPU cores
        #[clap(long, default_value_t = CORES_DEFAULT)]
        cores: u32,

        /// Memory in MiB
        #[clap(long, default_value_t = MEMORY_MIB_DEFAULT)]
        memory: u32,

        /// Bridge to attach, in interface order; repeat for more interfaces
        #[clap(long = "bridge")]
        bridges: Vec<String>,

        /// Raw disk image carrying the first-boot configuration
        #[clap(long)]
        config_disk: Option<PathBuf>,

        /// Start the instance once provisioned
        #[clap(long)]
        start: bool,

        /// Path to save the provisioning report
        #[clap(short, long)]
        report: Option<PathBuf>,

        /// Path to save an eventual fatal error
        #[clap(short, long)]
        error: Option<PathBuf>,
    },

    /// Provision every instance of a topology file
    Apply {
        /// Topology file listing the instances
        #[clap(index = 1)]
        topology: PathBuf,

        /// Image version for instances that do not request one
        #[clap(long)]
        version: Option<String>,

        /// Start every instance once provisioned
        #[clap(long)]
        start: bool,

        /// Path to save the provisioning reports
        #[clap(short, long)]
        report: Option<PathBuf>,
    },

    /// Check a topology file without touching the hypervisor
    Validate {
        /// Topology file listing the instances
        #[clap(index = 1)]
        topology: PathBuf,
    },

    /// Start an instance
    Start {
        #[clap(long)]
        id: u32,
    },

    /// Stop an instance
    Stop {
        #[clap(long)]
        id: u32,
    },

    /// Destroy an instance, stopping it first if needed
    Destroy {
        #[clap(long)]
        id: u32,

        /// Keep the disks and references to the instance
        #[clap(long)]
        keep_disks: bool,
    },

    /// Print the run state of an instance
    Status {
        #[clap(long)]
        id: u32,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Create { .. } => "create",
            Commands::Apply { .. } => "apply",
            Commands::Validate { .. } => "validate",
            Commands::Start { .. } => "start",
            Commands::Stop { .. } => "stop",
            Commands::Destroy { .. } => "destroy",
            Commands::Status { .. } => "status",
        }
    }

    /// Commands that change the hypervisor and keep a background log.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. } | Commands::Apply { .. } | Commands::Destroy { .. }
        )
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

use std::{panic, process::ExitCode};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info};

use fabriclab::{
    cli::{Cli, Commands},
    descriptor_from_args, load_hypervisor_config, write_yaml, BackgroundLog, Fabriclab,
    MultiLogger, FABRICLAB_VERSION,
};
use fabriclab_api::{
    constants::FABRICLAB_BACKGROUND_LOG_PATH,
    error::{FabricError, FabricResultExt, InternalError},
};

fn run_fabriclab(args: &Cli) -> Result<(), FabricError> {
    info!("Fabriclab version: {FABRICLAB_VERSION}");

    let config = load_hypervisor_config(args.config.as_deref())
        .message("Failed to load hypervisor configuration")?;

    // Validation never touches the hypervisor
    if let Commands::Validate { topology } = &args.command {
        fabriclab::load_topology(topology, &config)?;
        info!("Topology '{}' is valid", topology.display());
        return Ok(());
    }

    let res = panic::catch_unwind(|| {
        let fabriclab = Fabriclab::new(config);
        let res = match &args.command {
            Commands::Create {
                id,
                name,
                version,
                cores,
                memory,
                bridges,
                config_disk,
                start,
                report,
                error,
            } => {
                let descriptor = descriptor_from_args(
                    *id,
                    name,
                    version.as_deref(),
                    *cores,
                    *memory,
                    bridges,
                    config_disk.as_deref(),
                    *start,
                );
                let res = fabriclab.create(&descriptor);

                if let (Some(report_path), Ok(report)) = (report, &res) {
                    if let Err(e) = write_yaml(report_path, report) {
                        error!("Failed to write report: {e:?}");
                    }
                }

                if let (Some(error_path), Err(e)) = (error, &res) {
                    if let Err(e2) = write_yaml(error_path, e) {
                        error!("Failed to write error to file: {e2:?}");
                    }
                }

                res.map(|report| {
                    info!(
                        "Created instance {} ({}), console on port {}",
                        report.id, report.name, report.console_port
                    );
                })
            }
            Commands::Apply {
                topology,
                version,
                start,
                report,
            } => fabriclab
                .apply(topology, version.as_deref(), *start)
                .and_then(|reports| match report {
                    Some(path) => write_yaml(path, &reports),
                    None => Ok(()),
                }),
            Commands::Start { id } => fabriclab.start(*id),
            Commands::Stop { id } => fabriclab.stop(*id),
            Commands::Destroy { id, keep_disks } => fabriclab.destroy(*id, !keep_disks),
            Commands::Status { id } => fabriclab.status(*id).map(|state| match state {
                Some(state) => println!("{state}"),
                None => println!("unknown"),
            }),
            Commands::Validate { .. } => Err(FabricError::internal("Invalid command")),
        };

        res.message(format!("Failed to execute '{}' command", args.command))
    });

    match res {
        Err(e) => Err(FabricError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r,
    }
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    let mut multilogger = MultiLogger::new().with_logger(Box::new(
        env_logger::builder()
            .format_timestamp(None)
            .filter_level(args.verbosity)
            .build(),
    ));

    if args.command.is_mutating() {
        multilogger.add_logger(BackgroundLog::new(FABRICLAB_BACKGROUND_LOG_PATH).into_logger());
    }

    multilogger.init().context("Logger already registered")
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    if let Err(e) = run_fabriclab(&args) {
        error!("Fabriclab failed: {e:?}");
        return ExitCode::from(2);
    }

    ExitCode::SUCCESS
}

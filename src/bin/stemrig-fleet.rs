//! Capacity-testing fleet tool for stemrig.
//!
//! `launch` rents up to N instances one after another and records every
//! success in the instance registry; `destroy-all` destroys whatever the
//! registry lists. Ctrl-C during a launch stops after the pending create and
//! still records what was created.

use std::io::{self, Write as _};
use std::process;

use clap::{Parser, Subcommand};
use stemrig::fleet::{ClearPolicy, FleetLauncher, destroy_all};
use stemrig::{ProviderGateway, StemrigConfig, telemetry};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(
    name = "stemrig-fleet",
    about = "Launch and clean up batches of GPU instances for capacity testing"
)]
struct Cli {
    /// Log at debug level unless `STEMRIG_LOG` says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: FleetCommand,
}

#[derive(Debug, Subcommand)]
enum FleetCommand {
    /// Launch instances and record them in the registry.
    Launch {
        /// Number of instances to launch.
        #[arg(short = 'n', long = "num-instances", default_value_t = 50)]
        count: usize,
    },
    /// Destroy every instance recorded in the registry.
    DestroyAll {
        /// Delete the registry even when some destroys failed.
        #[arg(long)]
        force_clear: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    if let Err(message) = dispatch(cli.command).await {
        writeln!(io::stderr(), "{message}").ok();
        process::exit(1);
    }
}

async fn dispatch(command: FleetCommand) -> Result<(), String> {
    let config = StemrigConfig::load_without_cli_args().map_err(|err| err.to_string())?;
    let registry = config.registry();
    let gateway = ProviderGateway::from_config(&config).map_err(|err| err.to_string())?;
    let mut out = io::stdout().lock();

    match command {
        FleetCommand::Launch { count } => {
            let settings = config.fleet_settings().map_err(|err| err.to_string())?;
            let launcher = FleetLauncher::prepare(&gateway, &registry, settings)
                .await
                .map_err(|err| err.to_string())?;
            writeln!(
                out,
                "launching {count} instance(s) across {} offer(s)",
                launcher.offers().len()
            )
            .map_err(|err| err.to_string())?;
            let summary = launcher
                .launch(count, interrupt_signal())
                .await
                .map_err(|err| err.to_string())?;
            writeln!(
                out,
                "fleet launch {}: attempted={}, succeeded={}, failed={}, registry={}",
                if summary.interrupted { "interrupted" } else { "complete" },
                summary.attempted,
                summary.succeeded,
                summary.failed,
                registry.path()
            )
            .map_err(|err| err.to_string())?;
        }
        FleetCommand::DestroyAll { force_clear } => {
            let policy = if force_clear {
                ClearPolicy::ClearAll
            } else {
                ClearPolicy::RetainFailed
            };
            let summary = destroy_all(&gateway, &registry, policy)
                .await
                .map_err(|err| err.to_string())?;
            writeln!(
                out,
                "destroy-all complete: attempted={}, destroyed={}, failed={}, registry_cleared={}",
                summary.attempted,
                summary.destroyed,
                summary.failed.len(),
                summary.registry_cleared
            )
            .map_err(|err| err.to_string())?;
            for record in &summary.failed {
                writeln!(out, "still active: {} ({})", record.instance_id, record.gpu_name)
                    .map_err(|err| err.to_string())?;
            }
        }
    }
    Ok(())
}

async fn interrupt_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    warn!("interrupt received; finishing the pending launch");
}

//! Binary entry point for the stemrig CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing::warn;

use stemrig::config::StemrigConfig;
use stemrig::job::{ConsoleEvents, JobController, MemoryJobStore};
use stemrig::marketplace::{Marketplace, Offer};
use stemrig::poll::TokioClock;
use stemrig::ranking::rank;
use stemrig::run::{RunError, RunOrchestrator, RunReport, RunRequest};
use stemrig::service::{HttpConnector, JobListing, JobStatus, ServiceClient};
use stemrig::teardown::TeardownOutcome;
use stemrig::{GatewayError, ProviderGateway, telemetry};

use cli::{
    Cli, Command, DestroyCommand, JobsAction, JobsCommand, OffersCommand, SeparateCommand,
    StatusFilter,
};

/// Exit status used when the user interrupts a run.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("marketplace error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("run failed: {0}")]
    Run(#[from] RunError<GatewayError>),
    #[error("service error: {0}")]
    Service(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Run(err) if err.is_interrupted() => INTERRUPTED_EXIT_CODE,
            _ => 1,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init(cli.verbose);
    let exit_code = match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

async fn dispatch(command: Command) -> Result<(), CliError> {
    match command {
        Command::Offers(args) => list_offers(&args).await,
        Command::Separate(args) => separate(args).await,
        Command::Destroy(args) => destroy(&args).await,
        Command::Jobs(args) => jobs(args).await,
    }
}

fn load_config() -> Result<StemrigConfig, CliError> {
    let config =
        StemrigConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

async fn list_offers(args: &OffersCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let gateway = ProviderGateway::from_config(&config)?;
    let found = gateway.search_offers(&config.offer_query()).await?;
    let ranked = rank(
        &found,
        &config.ranking_policy(args.limit.unwrap_or(config.max_offers)),
    );

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "{} offers from {}, {} after ranking",
        found.len(),
        gateway.provider(),
        ranked.len()
    )?;
    for (position, offer) in ranked.iter().enumerate() {
        writeln!(out, "{:>2}. {}", position.saturating_add(1), render_offer(offer))?;
    }
    Ok(())
}

fn render_offer(offer: &Offer) -> String {
    format!(
        "{:<12} {:<22} {:>5.1} GB  ${:.3}/h  reliability {:.3}  {}",
        offer.id,
        offer.gpu_name,
        offer.vram_gb,
        offer.price_per_hour,
        offer.reliability,
        offer.availability
    )
}

async fn separate(args: SeparateCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let mut settings = config
        .run_settings()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let gateway = ProviderGateway::from_config(&config)?;

    let destination = Utf8PathBuf::from(args.output).join(&args.artifact);
    let mut request = RunRequest::new(args.input_url, destination);
    request.artifact = args.artifact;
    request.job.interval_cut = args.interval_cut;
    request.job.all_stems = args.all_stems;
    request.keep_instance = args.keep_instance;

    if args.no_stream {
        settings.job.stream_logs = false;
    }
    let orchestrator = RunOrchestrator::new(gateway, HttpConnector, settings);
    let mut events = ConsoleEvents::new(io::stdout());
    let report = orchestrator
        .execute(&request, &mut events, shutdown_signal())
        .await?;
    write_report(io::stdout().lock(), &report)?;
    Ok(())
}

fn write_report(mut out: impl Write, report: &RunReport) -> io::Result<()> {
    writeln!(out, "result: {}", report.artifact_path)?;
    writeln!(
        out,
        "job {} finished in {}s on {} ({}, ${:.3}/h) after {} create attempt(s)",
        report.job.job_id,
        report.job.waited.as_secs(),
        report.instance_id,
        report.offer.gpu_name,
        report.offer.price_per_hour,
        report.attempts
    )?;
    match report.teardown {
        TeardownOutcome::Destroyed => writeln!(out, "instance {} destroyed", report.instance_id),
        TeardownOutcome::Retained => writeln!(
            out,
            "instance {} kept at {}; destroy it with `stemrig destroy {}`",
            report.instance_id, report.endpoint, report.instance_id
        ),
    }
}

async fn destroy(args: &DestroyCommand) -> Result<(), CliError> {
    let config = load_config()?;
    let gateway = ProviderGateway::from_config(&config)?;
    gateway.destroy_instance(&args.instance_id).await?;
    writeln!(io::stdout(), "instance {} destroyed", args.instance_id)?;
    Ok(())
}

async fn jobs(args: JobsCommand) -> Result<(), CliError> {
    let client = ServiceClient::with_base_url(args.endpoint)
        .map_err(|err| CliError::Service(err.to_string()))?;
    let store = MemoryJobStore::new();
    let controller = JobController::new(&client, &store, &TokioClock);
    match args.action {
        JobsAction::List { status, limit } => {
            let listing = controller
                .list_remote(status.map(job_status), limit)
                .await
                .map_err(|err| CliError::Service(err.to_string()))?;
            write_listing(io::stdout().lock(), &listing)?;
        }
        JobsAction::Delete { job_id } => {
            controller
                .delete(&job_id)
                .await
                .map_err(|err| CliError::Service(err.to_string()))?;
            writeln!(io::stdout(), "job {job_id} deleted")?;
        }
    }
    Ok(())
}

const fn job_status(filter: StatusFilter) -> JobStatus {
    match filter {
        StatusFilter::Pending => JobStatus::Pending,
        StatusFilter::Running => JobStatus::Running,
        StatusFilter::Completed => JobStatus::Completed,
        StatusFilter::Failed => JobStatus::Failed,
    }
}

fn write_listing(mut out: impl Write, listing: &JobListing) -> io::Result<()> {
    writeln!(out, "{} of {} jobs", listing.jobs.len(), listing.total)?;
    for job in &listing.jobs {
        writeln!(
            out,
            "{:<38} {:<10} {}",
            job.job_id,
            job.status,
            job.created_at.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

/// Resolves on Ctrl-C. When the handler cannot be installed the future
/// never resolves, so runs proceed uninterrupted.
async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    warn!("interrupt received; cleaning up");
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

//! Command-line interface definitions for the `stemrig` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `stemrig` binary.
#[derive(Debug, Parser)]
#[command(
    name = "stemrig",
    about = "Rent a GPU, separate an audio track on it, and tear it down again",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level unless `STEMRIG_LOG` says otherwise.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `stemrig`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// List the ranked GPU offers a run would try.
    #[command(name = "offers", visible_alias = "list-offers")]
    Offers(OffersCommand),
    /// Rent an instance, run a separation job, download the result, and
    /// destroy the instance.
    #[command(name = "separate")]
    Separate(SeparateCommand),
    /// Destroy an instance by id.
    #[command(name = "destroy")]
    Destroy(DestroyCommand),
    /// Inspect or delete jobs on a running separation service.
    #[command(name = "jobs")]
    Jobs(JobsCommand),
}

/// Arguments for `stemrig offers`.
#[derive(Debug, Parser)]
pub(crate) struct OffersCommand {
    /// Number of offers to show; defaults to the configured run depth.
    #[arg(long, value_name = "N")]
    pub(crate) limit: Option<usize>,
}

/// Arguments for `stemrig separate`.
#[derive(Debug, Parser)]
pub(crate) struct SeparateCommand {
    /// URL of the audio file to process.
    #[arg(value_name = "INPUT_URL")]
    pub(crate) input_url: String,
    /// Directory receiving the result.
    #[arg(short, long, value_name = "DIR", default_value = "./results")]
    pub(crate) output: String,
    /// Result file to download.
    #[arg(long, value_name = "FILE", default_value = "instrumental.mp3")]
    pub(crate) artifact: String,
    /// Cut timestamps in seconds, for example `300,600,900`.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) interval_cut: Option<String>,
    /// Extract every stem instead of the instrumental only.
    #[arg(long)]
    pub(crate) all_stems: bool,
    /// Leave the instance running afterwards.
    #[arg(long, visible_alias = "keep-pod")]
    pub(crate) keep_instance: bool,
    /// Show progress instead of streaming the remote log.
    #[arg(long)]
    pub(crate) no_stream: bool,
}

/// Arguments for `stemrig destroy`.
#[derive(Debug, Parser)]
pub(crate) struct DestroyCommand {
    /// Instance to destroy.
    #[arg(value_name = "INSTANCE_ID")]
    pub(crate) instance_id: String,
}

/// Arguments for `stemrig jobs`.
#[derive(Debug, Parser)]
pub(crate) struct JobsCommand {
    /// Base URL of the separation service, for example `http://1.2.3.4:40123`.
    #[arg(long, value_name = "URL")]
    pub(crate) endpoint: String,
    /// Job operation.
    #[command(subcommand)]
    pub(crate) action: JobsAction,
}

/// Job operations against a running service.
#[derive(Debug, Subcommand)]
pub(crate) enum JobsAction {
    /// List jobs, newest first.
    List {
        /// Only show jobs in this state.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
        /// Maximum number of jobs to show.
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete a finished job and its files.
    Delete {
        /// Job to delete.
        #[arg(value_name = "JOB_ID")]
        job_id: String,
    },
}

/// Job states accepted by `stemrig jobs list --status`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum StatusFilter {
    /// Accepted, not started.
    Pending,
    /// Processing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

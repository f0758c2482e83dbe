//! Wire types exchanged with the separation service.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Remote job lifecycle state.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not started.
    Pending,
    /// Processing.
    Running,
    /// Finished successfully; results can be downloaded.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobStatus {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns `true` for `completed` and `failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position in the lifecycle; terminal states share the highest rank.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed => 2,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to `GET /status`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ServerStatus {
    /// Free-form service status.
    pub status: String,
    /// Whether the separation models are extracted and loaded.
    pub models_ready: bool,
    /// Jobs currently running.
    #[serde(default)]
    pub active_jobs: u32,
    /// Jobs finished since start-up.
    #[serde(default)]
    pub completed_jobs: u32,
    /// Seconds since the service started.
    #[serde(default)]
    pub uptime_seconds: u64,
}

/// Body of `POST /job`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct JobRequest {
    /// URL of the audio file to process.
    pub input_url: String,
    /// Comma separated cut timestamps in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_cut: Option<String>,
    /// Extract every stem instead of the instrumental only.
    pub all_stems: bool,
    /// Caller-chosen job identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobRequest {
    /// Creates a request for the instrumental stem of `input_url`.
    #[must_use]
    pub fn new(input_url: impl Into<String>) -> Self {
        Self {
            input_url: input_url.into(),
            ..Self::default()
        }
    }
}

/// Reply to `POST /job`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct JobAccepted {
    /// Identifier assigned to the job.
    pub job_id: String,
    /// Initial status, normally `pending`.
    pub status: JobStatus,
    /// Human readable acknowledgement.
    #[serde(default)]
    pub message: String,
}

/// Structured progress reported while a job runs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct JobDetails {
    /// Segments already separated.
    #[serde(default)]
    pub completed_segments: Option<u64>,
    /// Total segments in the input.
    #[serde(default)]
    pub total_segments: Option<u64>,
    /// Completion percentage, when the service reports one directly.
    #[serde(default)]
    pub percent: Option<f64>,
}

/// Reply to `GET /job/{id}`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct JobStatusReport {
    /// Job identifier.
    pub job_id: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Current processing stage.
    #[serde(default)]
    pub state: Option<String>,
    /// Per-task states.
    #[serde(default)]
    pub tasks: Option<BTreeMap<String, String>>,
    /// Segment progress.
    #[serde(default)]
    pub details: Option<JobDetails>,
    /// Seconds spent processing so far.
    #[serde(default)]
    pub elapsed_seconds: Option<f64>,
    /// Failure description for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
}

/// Reply to `GET /job/{id}/logs`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct LogChunk {
    /// Text appended since the requested offset.
    #[serde(default)]
    pub logs: String,
    /// Offset to request next.
    pub offset: u64,
    /// Job status at the time of the read.
    #[serde(default)]
    pub status: Option<String>,
}

/// One entry of `GET /jobs`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct JobSummary {
    /// Job identifier.
    pub job_id: String,
    /// Lifecycle state.
    pub status: JobStatus,
    /// Creation timestamp as reported by the service.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Completion timestamp, when finished.
    #[serde(default)]
    pub completed_at: Option<String>,
}

/// Reply to `GET /jobs`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct JobListing {
    /// Jobs matching the filter.
    pub jobs: Vec<JobSummary>,
    /// Total jobs known to the service.
    pub total: u64,
}

//! Local job records.
//!
//! The remote service is authoritative; records here are a cache refreshed
//! on every poll. Updates never move a record backwards through the
//! lifecycle.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;

use crate::service::{JobDetails, JobStatus, JobStatusReport};

/// Progress detail attached to a job record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobProgress {
    /// Current processing stage.
    pub state: Option<String>,
    /// Segments already separated.
    pub completed_segments: Option<u64>,
    /// Total segments in the input.
    pub total_segments: Option<u64>,
    /// Completion percentage reported by the service.
    pub percent: Option<f64>,
    /// Seconds spent processing so far.
    pub elapsed_seconds: Option<f64>,
}

impl JobProgress {
    fn from_report(report: &JobStatusReport) -> Option<Self> {
        let details = report.details.clone().unwrap_or_default();
        let JobDetails {
            completed_segments,
            total_segments,
            percent,
        } = details;
        let progress = Self {
            state: report.state.clone(),
            completed_segments,
            total_segments,
            percent,
            elapsed_seconds: report.elapsed_seconds,
        };
        (progress != Self::default()).then_some(progress)
    }

    /// Renders a short progress line such as `42% (21/50)`.
    ///
    /// Segment counts take precedence; the reported percentage is used when
    /// no segment total is known.
    #[must_use]
    pub fn describe(&self) -> Option<String> {
        if let (Some(done), Some(total)) = (self.completed_segments, self.total_segments) {
            if let Some(pct) = done.saturating_mul(100).checked_div(total) {
                return Some(format!("{pct}% ({done}/{total})"));
            }
        }
        self.percent.map(|pct| format!("{pct:.0}%"))
    }
}

/// Locally cached view of a remote job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobRecord {
    /// Remote job identifier.
    pub job_id: String,
    /// Last accepted lifecycle state.
    pub status: JobStatus,
    /// Last reported progress.
    pub progress: Option<JobProgress>,
    /// Failure message for failed jobs.
    pub error: Option<String>,
}

impl JobRecord {
    /// Creates a `pending` record.
    #[must_use]
    pub fn pending(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            progress: None,
            error: None,
        }
    }

    /// Creates a record mirroring a status report.
    #[must_use]
    pub fn from_report(report: &JobStatusReport) -> Self {
        Self {
            job_id: report.job_id.clone(),
            status: report.status,
            progress: JobProgress::from_report(report),
            error: report.error.clone(),
        }
    }

    /// Merges a status report into the record.
    ///
    /// Reports that would move the record to an earlier state, or away from
    /// a terminal state, are ignored.
    pub fn apply(&mut self, report: &JobStatusReport) -> UpdateOutcome {
        let stale = report.status.rank() < self.status.rank()
            || (self.status.is_terminal() && report.status != self.status);
        if stale {
            return UpdateOutcome::Ignored {
                current: self.status,
                reported: report.status,
            };
        }
        self.status = report.status;
        if let Some(progress) = JobProgress::from_report(report) {
            self.progress = Some(progress);
        }
        if report.error.is_some() {
            self.error.clone_from(&report.error);
        }
        UpdateOutcome::Applied
    }
}

/// Result of merging a report into a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// The record now reflects the report.
    Applied,
    /// The report was stale and left the record unchanged.
    Ignored {
        /// Status kept.
        current: JobStatus,
        /// Status reported and discarded.
        reported: JobStatus,
    },
}

/// Errors raised by job stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// A record with the same id already exists.
    #[error("job {job_id} already recorded")]
    Duplicate {
        /// Conflicting job id.
        job_id: String,
    },
    /// No record exists for the id.
    #[error("job {job_id} not recorded")]
    Missing {
        /// Requested job id.
        job_id: String,
    },
    /// The store's lock was poisoned by a panicking writer.
    #[error("job store lock poisoned")]
    Poisoned,
}

/// Storage for local job records.
pub trait JobStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the id is already present.
    fn create(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Returns the record for `job_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unavailable.
    fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Returns every record ordered by job id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unavailable.
    fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Merges a status report into the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Missing`] when no record exists.
    fn update(&self, report: &JobStatusReport) -> Result<UpdateOutcome, StoreError>;

    /// Removes a record, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store is unavailable.
    fn delete(&self, job_id: &str) -> Result<bool, StoreError>;
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    records: Mutex<BTreeMap<String, JobRecord>>,
}

impl MemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, JobRecord>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        if records.contains_key(&record.job_id) {
            return Err(StoreError::Duplicate {
                job_id: record.job_id,
            });
        }
        records.insert(record.job_id.clone(), record);
        Ok(())
    }

    fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.lock()?.get(job_id).cloned())
    }

    fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn update(&self, report: &JobStatusReport) -> Result<UpdateOutcome, StoreError> {
        let mut records = self.lock()?;
        let record = records
            .get_mut(&report.job_id)
            .ok_or_else(|| StoreError::Missing {
                job_id: report.job_id.clone(),
            })?;
        Ok(record.apply(report))
    }

    fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(job_id).is_some())
    }
}

//! Job submission and completion tracking.
//!
//! [`JobController`] submits work to the separation service, keeps a local
//! record in an injected [`JobStore`], and polls until the job reaches a
//! terminal state. While polling it can stream the job's log through a
//! [`LogCursor`]; if streaming fails it falls back to progress lines for the
//! rest of the wait.

mod events;
mod store;

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::poll::{Clock, Deadline, PollPolicy};
use crate::service::{
    JobListing, JobRequest, JobService, JobStatus, JobStatusReport, ServiceError,
};

pub use events::{ConsoleEvents, JobEvents, LogCursor};
pub use store::{JobProgress, JobRecord, JobStore, MemoryJobStore, StoreError, UpdateOutcome};

/// Errors raised while running a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// The separation service could not be reached or rejected a call.
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// The job finished in the `failed` state.
    #[error("job {job_id} failed: {message}")]
    Failed {
        /// Remote job id.
        job_id: String,
        /// Failure message reported by the service.
        message: String,
    },
    /// The job did not finish in time; it keeps running remotely.
    #[error("job {job_id} still running after {}s", elapsed.as_secs())]
    Timeout {
        /// Remote job id.
        job_id: String,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The local job store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Options for [`JobController::await_completion`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AwaitOptions {
    /// Poll interval and overall bound.
    pub policy: PollPolicy,
    /// Stream the remote log while waiting.
    pub stream_logs: bool,
}

impl Default for AwaitOptions {
    fn default() -> Self {
        Self {
            policy: PollPolicy::job(),
            stream_logs: true,
        }
    }
}

/// Summary of a completed job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobReport {
    /// Remote job id.
    pub job_id: String,
    /// Final record as cached locally.
    pub record: JobRecord,
    /// Wall time spent waiting.
    pub waited: Duration,
    /// Log bytes emitted while waiting.
    pub log_bytes: u64,
}

/// Drives a job through its lifecycle against one service.
#[derive(Debug)]
pub struct JobController<'a, S: ?Sized, St: ?Sized, C: ?Sized> {
    service: &'a S,
    store: &'a St,
    clock: &'a C,
}

struct Stream {
    cursor: LogCursor,
    enabled: bool,
    emitted: u64,
}

impl<'a, S, St, C> JobController<'a, S, St, C>
where
    S: JobService + ?Sized,
    St: JobStore + ?Sized,
    C: Clock + ?Sized,
{
    /// Creates a controller.
    #[must_use]
    pub const fn new(service: &'a S, store: &'a St, clock: &'a C) -> Self {
        Self {
            service,
            store,
            clock,
        }
    }

    /// Submits a job and records it locally as `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Service`] when the service rejects the request or
    /// cannot be reached; submission is never retried.
    pub async fn submit(&self, request: &JobRequest) -> Result<String, JobError> {
        let accepted = self.service.submit(request).await?;
        info!(job_id = %accepted.job_id, "job submitted");
        self.store.create(JobRecord::pending(&accepted.job_id))?;
        Ok(accepted.job_id)
    }

    /// Polls a job until it completes, fails, or the bound elapses.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Failed`] when the job fails remotely,
    /// [`JobError::Timeout`] when the bound elapses, and
    /// [`JobError::Service`] when a status poll fails.
    pub async fn await_completion<E>(
        &self,
        job_id: &str,
        options: AwaitOptions,
        events: &mut E,
    ) -> Result<JobReport, JobError>
    where
        E: JobEvents + Send + ?Sized,
    {
        let deadline = Deadline::after(self.clock, options.policy.timeout);
        let mut stream = Stream {
            cursor: LogCursor::default(),
            enabled: options.stream_logs,
            emitted: 0,
        };
        let mut last_status = None;

        while !deadline.expired(self.clock.now()) {
            let report = self.service.job(job_id).await?;
            let record = self.refresh(&report)?;
            if last_status != Some(record.status) {
                events.phase_changed(job_id, record.status);
                last_status = Some(record.status);
            }

            match record.status {
                JobStatus::Completed => {
                    self.final_flush(job_id, &mut stream, events).await;
                    info!(%job_id, "job completed");
                    return Ok(JobReport {
                        job_id: job_id.to_owned(),
                        record,
                        waited: deadline.elapsed(self.clock.now()),
                        log_bytes: stream.emitted,
                    });
                }
                JobStatus::Failed => {
                    self.final_flush(job_id, &mut stream, events).await;
                    let message = record
                        .error
                        .unwrap_or_else(|| String::from("unknown error"));
                    warn!(%job_id, %message, "job failed");
                    return Err(JobError::Failed {
                        job_id: job_id.to_owned(),
                        message,
                    });
                }
                JobStatus::Pending | JobStatus::Running => {}
            }

            if stream.enabled {
                self.stream_once(job_id, &mut stream, events).await;
            }
            if !stream.enabled {
                if let Some(progress) = &record.progress {
                    events.progress(progress);
                }
            }
            self.clock.sleep(options.policy.interval).await;
        }

        Err(JobError::Timeout {
            job_id: job_id.to_owned(),
            elapsed: deadline.elapsed(self.clock.now()),
        })
    }

    /// Lists jobs known to the service.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Service`] when the listing fails.
    pub async fn list_remote(
        &self,
        filter: Option<JobStatus>,
        limit: u32,
    ) -> Result<JobListing, JobError> {
        Ok(self.service.list_jobs(filter, limit).await?)
    }

    /// Deletes a finished job remotely and drops its local record.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Service`] when the service refuses, for example
    /// because the job is still running.
    pub async fn delete(&self, job_id: &str) -> Result<(), JobError> {
        self.service.delete_job(job_id).await?;
        self.store.delete(job_id)?;
        info!(%job_id, "job deleted");
        Ok(())
    }

    fn refresh(&self, report: &JobStatusReport) -> Result<JobRecord, JobError> {
        if self.store.get(&report.job_id)?.is_none() {
            self.store.create(JobRecord::from_report(report))?;
        } else if let UpdateOutcome::Ignored { current, reported } = self.store.update(report)? {
            warn!(
                job_id = %report.job_id,
                %current,
                %reported,
                "ignoring stale job status"
            );
        }
        self.store
            .get(&report.job_id)?
            .ok_or_else(|| JobError::Store(StoreError::Missing {
                job_id: report.job_id.clone(),
            }))
    }

    async fn stream_once<E>(&self, job_id: &str, stream: &mut Stream, events: &mut E)
    where
        E: JobEvents + Send + ?Sized,
    {
        match self.service.logs(job_id, stream.cursor.offset()).await {
            Ok(chunk) => {
                if let Some(text) = stream.cursor.advance(&chunk) {
                    stream.emitted = stream
                        .emitted
                        .saturating_add(u64::try_from(text.len()).unwrap_or(u64::MAX));
                    events.log_text(&text);
                }
            }
            Err(err) => {
                warn!(%job_id, error = %err, "log streaming disabled");
                stream.enabled = false;
                events.streaming_disabled(&err.to_string());
            }
        }
    }

    async fn final_flush<E>(&self, job_id: &str, stream: &mut Stream, events: &mut E)
    where
        E: JobEvents + Send + ?Sized,
    {
        if !stream.enabled {
            return;
        }
        match self.service.logs(job_id, stream.cursor.offset()).await {
            Ok(chunk) => {
                if let Some(text) = stream.cursor.advance(&chunk) {
                    stream.emitted = stream
                        .emitted
                        .saturating_add(u64::try_from(text.len()).unwrap_or(u64::MAX));
                    events.log_text(&text);
                }
            }
            Err(err) => debug!(%job_id, error = %err, "final log flush failed"),
        }
    }
}

#[cfg(test)]
mod tests;

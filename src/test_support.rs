//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here script marketplace, service, and clock behaviour so the
//! orchestration logic can be exercised without network access or real
//! time passing.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::job::{JobEvents, JobProgress};
use crate::marketplace::{
    AvailabilityClass, Classify, Endpoint, InstanceSnapshot, InstanceSpec, InstanceStatus,
    MarketFuture, Marketplace, Offer, OfferQuery, PortMapping,
};
use crate::poll::{Clock, SleepFuture};
use crate::service::{
    JobAccepted, JobDetails, JobListing, JobRequest, JobService, JobStatus, JobStatusReport,
    JobSummary, LogChunk, ServerStatus, ServiceConnector, ServiceError, ServiceFuture,
};

fn locked<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds an offer with sensible defaults for tests.
#[must_use]
pub fn offer(id: &str, gpu_name: &str, price_per_hour: f64) -> Offer {
    Offer {
        id: id.to_owned(),
        gpu_name: gpu_name.to_owned(),
        vram_gb: 24.0,
        price_per_hour,
        reliability: 0.99,
        availability: AvailabilityClass::Community,
        num_gpus: 1,
        disk_gb: Some(40.0),
        driver_version: Some(12.2),
    }
}

/// Builds a snapshot for `status`, optionally publishing `port` on
/// `127.0.0.1`.
#[must_use]
pub fn snapshot(status: InstanceStatus, port: Option<u16>) -> InstanceSnapshot {
    InstanceSnapshot {
        id: String::new(),
        status,
        public_host: port.map(|_| String::from("127.0.0.1")),
        ports: port
            .map(|port| {
                vec![PortMapping {
                    private_port: port,
                    public_port: port,
                    host: None,
                }]
            })
            .unwrap_or_default(),
        cost_per_hour: Some(0.2),
    }
}

/// Error produced by [`ScriptedMarketplace`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedError {
    /// Simulated capacity failure.
    #[error("offer {offer_id} is no longer available")]
    Capacity {
        /// Offer that was rejected.
        offer_id: String,
    },
    /// Simulated systemic failure.
    #[error("scripted failure: {0}")]
    Fatal(String),
}

impl Classify for ScriptedError {
    fn is_capacity_unavailable(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

/// Outcome of one scripted create call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CreateStep {
    /// Succeed with the given instance id.
    Created(String),
    /// Fail with a capacity error.
    Capacity,
    /// Fail with a fatal error.
    Fatal(String),
}

#[derive(Clone, Debug)]
enum SnapshotStep {
    Snapshot(InstanceSnapshot),
    Failure(String),
}

#[derive(Debug, Default)]
struct MarketState {
    offers: Vec<Offer>,
    search_failure: Option<String>,
    search_calls: usize,
    create_script: VecDeque<CreateStep>,
    created: Vec<InstanceSpec>,
    next_id: usize,
    snapshots: VecDeque<SnapshotStep>,
    get_calls: usize,
    destroy_failures: BTreeSet<String>,
    destroy_attempts: Vec<String>,
    destroyed: Vec<String>,
}

/// Marketplace double driven by scripted outcomes.
///
/// Without a script, creates succeed with ids `inst-1`, `inst-2`, ... and
/// every instance reads as running with the service on `127.0.0.1:8185`.
#[derive(Clone, Debug, Default)]
pub struct ScriptedMarketplace {
    state: Arc<Mutex<MarketState>>,
}

impl ScriptedMarketplace {
    /// Creates a marketplace with no offers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a marketplace listing `offers`.
    #[must_use]
    pub fn with_offers(offers: Vec<Offer>) -> Self {
        let market = Self::new();
        locked(&market.state).offers = offers;
        market
    }

    /// Adds an offer to later search results.
    pub fn add_offer(&self, offer: Offer) {
        locked(&self.state).offers.push(offer);
    }

    /// Makes offer searches fail.
    pub fn fail_search(&self, message: &str) {
        locked(&self.state).search_failure = Some(message.to_owned());
    }

    /// Queues create outcomes, consumed in order.
    pub fn script_creates(&self, steps: impl IntoIterator<Item = CreateStep>) {
        locked(&self.state).create_script.extend(steps);
    }

    /// Queues a snapshot; the last queued snapshot repeats.
    pub fn push_snapshot(&self, snapshot: InstanceSnapshot) {
        locked(&self.state)
            .snapshots
            .push_back(SnapshotStep::Snapshot(snapshot));
    }

    /// Queues a failing `get_instance` call.
    pub fn push_get_failure(&self, message: &str) {
        locked(&self.state)
            .snapshots
            .push_back(SnapshotStep::Failure(message.to_owned()));
    }

    /// Makes destroying `instance_id` fail.
    pub fn fail_destroy(&self, instance_id: &str) {
        locked(&self.state)
            .destroy_failures
            .insert(instance_id.to_owned());
    }

    /// Number of offer searches performed.
    #[must_use]
    pub fn search_calls(&self) -> usize {
        locked(&self.state).search_calls
    }

    /// Specs passed to `create_instance`, in call order.
    #[must_use]
    pub fn created(&self) -> Vec<InstanceSpec> {
        locked(&self.state).created.clone()
    }

    /// Number of `get_instance` calls.
    #[must_use]
    pub fn get_calls(&self) -> usize {
        locked(&self.state).get_calls
    }

    /// Instance ids passed to `destroy_instance`, including failures.
    #[must_use]
    pub fn destroy_attempts(&self) -> Vec<String> {
        locked(&self.state).destroy_attempts.clone()
    }

    /// Instance ids destroyed successfully.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        locked(&self.state).destroyed.clone()
    }
}

impl Marketplace for ScriptedMarketplace {
    type Error = ScriptedError;

    fn search_offers<'a>(
        &'a self,
        _query: &'a OfferQuery,
    ) -> MarketFuture<'a, Vec<Offer>, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.search_calls = state.search_calls.saturating_add(1);
            match &state.search_failure {
                Some(message) => Err(ScriptedError::Fatal(message.clone())),
                None => Ok(state.offers.clone()),
            }
        })
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> MarketFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.created.push(spec.clone());
            match state.create_script.pop_front() {
                Some(CreateStep::Created(id)) => Ok(id),
                Some(CreateStep::Capacity) => Err(ScriptedError::Capacity {
                    offer_id: spec.offer_id.clone(),
                }),
                Some(CreateStep::Fatal(message)) => Err(ScriptedError::Fatal(message)),
                None => {
                    state.next_id = state.next_id.saturating_add(1);
                    Ok(format!("inst-{}", state.next_id))
                }
            }
        })
    }

    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> MarketFuture<'a, InstanceSnapshot, Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.get_calls = state.get_calls.saturating_add(1);
            let step = if state.snapshots.len() > 1 {
                state.snapshots.pop_front()
            } else {
                state.snapshots.front().cloned()
            };
            match step {
                Some(SnapshotStep::Failure(message)) => Err(ScriptedError::Fatal(message)),
                Some(SnapshotStep::Snapshot(snap)) => Ok(InstanceSnapshot {
                    id: instance_id.to_owned(),
                    ..snap
                }),
                None => Ok(InstanceSnapshot {
                    id: instance_id.to_owned(),
                    ..snapshot(InstanceStatus::Running, Some(8185))
                }),
            }
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> MarketFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.destroy_attempts.push(instance_id.to_owned());
            if state.destroy_failures.contains(instance_id) {
                return Err(ScriptedError::Fatal(format!(
                    "destroy of {instance_id} rejected"
                )));
            }
            state.destroyed.push(instance_id.to_owned());
            Ok(())
        })
    }
}

#[derive(Debug)]
struct ServiceState {
    health: VecDeque<bool>,
    models_ready: VecDeque<bool>,
    submit_failure: Option<ServiceError>,
    job_id: String,
    submitted: Vec<JobRequest>,
    reports: VecDeque<Result<JobStatusReport, ServiceError>>,
    logs: VecDeque<Result<LogChunk, ServiceError>>,
    log_offsets: Vec<u64>,
    artifacts: BTreeMap<String, Vec<u8>>,
    download_calls: usize,
    listing: Vec<JobSummary>,
    deleted: Vec<String>,
    delete_failure: Option<ServiceError>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            health: VecDeque::new(),
            models_ready: VecDeque::new(),
            submit_failure: None,
            job_id: String::from("job-1"),
            submitted: Vec::new(),
            reports: VecDeque::new(),
            logs: VecDeque::new(),
            log_offsets: Vec::new(),
            artifacts: BTreeMap::new(),
            download_calls: 0,
            listing: Vec::new(),
            deleted: Vec::new(),
            delete_failure: None,
        }
    }
}

fn sticky<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

/// Builds a status report for `job_id`.
#[must_use]
pub fn report(job_id: &str, status: JobStatus) -> JobStatusReport {
    JobStatusReport {
        job_id: job_id.to_owned(),
        status,
        state: None,
        tasks: None,
        details: None,
        elapsed_seconds: None,
        error: None,
    }
}

/// Builds a running report carrying segment progress.
#[must_use]
pub fn running_with_segments(job_id: &str, completed: u64, total: u64) -> JobStatusReport {
    JobStatusReport {
        state: Some(String::from("separating")),
        details: Some(JobDetails {
            completed_segments: Some(completed),
            total_segments: Some(total),
            percent: None,
        }),
        ..report(job_id, JobStatus::Running)
    }
}

/// Separation service double.
///
/// Unscripted, the service is healthy, its models are ready, submissions
/// return `job-1`, and every job reads as completed.
#[derive(Clone, Debug, Default)]
pub struct ScriptedService {
    state: Arc<Mutex<ServiceState>>,
}

impl ScriptedService {
    /// Creates an unscripted service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues health probe outcomes; the last one repeats.
    pub fn script_health(&self, outcomes: impl IntoIterator<Item = bool>) {
        locked(&self.state).health.extend(outcomes);
    }

    /// Queues `models_ready` values; the last one repeats.
    pub fn script_models_ready(&self, outcomes: impl IntoIterator<Item = bool>) {
        locked(&self.state).models_ready.extend(outcomes);
    }

    /// Makes submissions fail.
    pub fn fail_submit(&self, error: ServiceError) {
        locked(&self.state).submit_failure = Some(error);
    }

    /// Sets the id returned by submissions.
    pub fn set_job_id(&self, job_id: &str) {
        job_id.clone_into(&mut locked(&self.state).job_id);
    }

    /// Queues job status reports; the last one repeats.
    pub fn script_reports(&self, reports: impl IntoIterator<Item = JobStatusReport>) {
        locked(&self.state)
            .reports
            .extend(reports.into_iter().map(Ok));
    }

    /// Queues a failing status poll.
    pub fn push_report_failure(&self, error: ServiceError) {
        locked(&self.state).reports.push_back(Err(error));
    }

    /// Queues a log chunk, consumed once.
    pub fn push_logs(&self, logs: &str, offset: u64) {
        locked(&self.state).logs.push_back(Ok(LogChunk {
            logs: logs.to_owned(),
            offset,
            status: None,
        }));
    }

    /// Queues a failing log read, consumed once.
    pub fn push_log_failure(&self, error: ServiceError) {
        locked(&self.state).logs.push_back(Err(error));
    }

    /// Registers a downloadable artefact.
    pub fn set_artifact(&self, name: &str, contents: Vec<u8>) {
        locked(&self.state)
            .artifacts
            .insert(name.to_owned(), contents);
    }

    /// Sets the jobs returned by listings.
    pub fn set_listing(&self, jobs: Vec<JobSummary>) {
        locked(&self.state).listing = jobs;
    }

    /// Makes deletions fail.
    pub fn fail_delete(&self, error: ServiceError) {
        locked(&self.state).delete_failure = Some(error);
    }

    /// Requests submitted so far.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobRequest> {
        locked(&self.state).submitted.clone()
    }

    /// Offsets requested from the log endpoint, in order.
    #[must_use]
    pub fn log_offsets(&self) -> Vec<u64> {
        locked(&self.state).log_offsets.clone()
    }

    /// Number of download calls.
    #[must_use]
    pub fn download_calls(&self) -> usize {
        locked(&self.state).download_calls
    }

    /// Jobs deleted so far.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        locked(&self.state).deleted.clone()
    }
}

impl JobService for ScriptedService {
    fn health(&self) -> ServiceFuture<'_, ()> {
        Box::pin(async move {
            if sticky(&mut locked(&self.state).health).unwrap_or(true) {
                Ok(())
            } else {
                Err(ServiceError::Transport {
                    message: String::from("connection refused"),
                })
            }
        })
    }

    fn status(&self) -> ServiceFuture<'_, ServerStatus> {
        Box::pin(async move {
            let models_ready = sticky(&mut locked(&self.state).models_ready).unwrap_or(true);
            Ok(ServerStatus {
                status: String::from("healthy"),
                models_ready,
                active_jobs: 0,
                completed_jobs: 0,
                uptime_seconds: 1,
            })
        })
    }

    fn submit<'a>(&'a self, request: &'a JobRequest) -> ServiceFuture<'a, JobAccepted> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if let Some(err) = state.submit_failure.clone() {
                return Err(err);
            }
            state.submitted.push(request.clone());
            let job_id = request.job_id.clone().unwrap_or_else(|| state.job_id.clone());
            Ok(JobAccepted {
                job_id,
                status: JobStatus::Pending,
                message: String::from("accepted"),
            })
        })
    }

    fn job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, JobStatusReport> {
        Box::pin(async move {
            match sticky(&mut locked(&self.state).reports) {
                Some(Ok(found)) => Ok(JobStatusReport {
                    job_id: job_id.to_owned(),
                    ..found
                }),
                Some(Err(err)) => Err(err),
                None => Ok(report(job_id, JobStatus::Completed)),
            }
        })
    }

    fn logs<'a>(&'a self, _job_id: &'a str, offset: u64) -> ServiceFuture<'a, LogChunk> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            state.log_offsets.push(offset);
            state.logs.pop_front().unwrap_or(Ok(LogChunk {
                logs: String::new(),
                offset,
                status: None,
            }))
        })
    }

    fn download<'a>(
        &'a self,
        _job_id: &'a str,
        file: &'a str,
        destination: &'a Utf8Path,
    ) -> ServiceFuture<'a, u64> {
        Box::pin(async move {
            let contents = {
                let mut state = locked(&self.state);
                state.download_calls = state.download_calls.saturating_add(1);
                match state.artifacts.get(file) {
                    Some(contents) => contents.clone(),
                    None => {
                        let available: Vec<&String> = state.artifacts.keys().collect();
                        return Err(ServiceError::NotFound {
                            message: format!("File '{file}' not found. Available: {available:?}"),
                        });
                    }
                }
            };
            tokio::fs::write(destination.as_std_path(), &contents)
                .await
                .map_err(|err| ServiceError::Io {
                    path: destination.to_string(),
                    message: err.to_string(),
                })?;
            Ok(u64::try_from(contents.len()).unwrap_or(u64::MAX))
        })
    }

    fn list_jobs(&self, filter: Option<JobStatus>, limit: u32) -> ServiceFuture<'_, JobListing> {
        Box::pin(async move {
            let state = locked(&self.state);
            let max = usize::try_from(limit).unwrap_or(usize::MAX);
            let jobs = state
                .listing
                .iter()
                .filter(|job| filter.is_none_or(|status| job.status == status))
                .take(max)
                .cloned()
                .collect();
            Ok(JobListing {
                jobs,
                total: u64::try_from(state.listing.len()).unwrap_or(u64::MAX),
            })
        })
    }

    fn delete_job<'a>(&'a self, job_id: &'a str) -> ServiceFuture<'a, ()> {
        Box::pin(async move {
            let mut state = locked(&self.state);
            if let Some(err) = state.delete_failure.clone() {
                return Err(err);
            }
            state.deleted.push(job_id.to_owned());
            Ok(())
        })
    }
}

/// Connector handing out clones of one [`ScriptedService`].
#[derive(Clone, Debug, Default)]
pub struct ScriptedConnector {
    service: ScriptedService,
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
}

impl ScriptedConnector {
    /// Wraps a service.
    #[must_use]
    pub fn new(service: ScriptedService) -> Self {
        Self {
            service,
            endpoints: Arc::default(),
        }
    }

    /// Endpoints connected to so far.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Endpoint> {
        locked(&self.endpoints).clone()
    }
}

impl ServiceConnector for ScriptedConnector {
    type Service = ScriptedService;

    fn connect(&self, endpoint: &Endpoint) -> Result<Self::Service, ServiceError> {
        locked(&self.endpoints).push(endpoint.clone());
        Ok(self.service.clone())
    }
}

/// Virtual clock: sleeping advances time instantly.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
            sleeps: Arc::default(),
        }
    }
}

impl ManualClock {
    /// Creates a clock starting at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves time forward without sleeping.
    pub fn advance(&self, duration: Duration) {
        let mut now = locked(&self.now);
        if let Some(next) = now.checked_add(duration) {
            *now = next;
        }
    }

    /// Sleeps requested so far.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        locked(&self.sleeps).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *locked(&self.now)
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        locked(&self.sleeps).push(duration);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

/// Event sink recording everything it receives.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordingEvents {
    /// Log text in emission order.
    pub logs: Vec<String>,
    /// Progress updates.
    pub progress: Vec<JobProgress>,
    /// Phase changes.
    pub phases: Vec<JobStatus>,
    /// Reasons streaming was disabled.
    pub disabled: Vec<String>,
}

impl RecordingEvents {
    /// Concatenated log text.
    #[must_use]
    pub fn log_text(&self) -> String {
        self.logs.concat()
    }
}

impl JobEvents for RecordingEvents {
    fn log_text(&mut self, text: &str) {
        self.logs.push(text.to_owned());
    }

    fn progress(&mut self, progress: &JobProgress) {
        self.progress.push(progress.clone());
    }

    fn phase_changed(&mut self, _job_id: &str, status: JobStatus) {
        self.phases.push(status);
    }

    fn streaming_disabled(&mut self, reason: &str) {
        self.disabled.push(reason.to_owned());
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets and clears environment variables while holding a global mutex.
    ///
    /// Pairs with a `None` value are removed for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, Option<&str>)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe {
                match value {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

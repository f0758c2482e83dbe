//! Single-run orchestration: rent, separate, download, tear down.
//!
//! [`RunOrchestrator::execute`] walks the whole lifecycle for one job. Once
//! an instance exists it is owned by a [`TeardownGuard`], and the guard is
//! released on every exit path, including interruption.

use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use tracing::{error, info, warn};

use crate::fetch::{DEFAULT_ARTIFACT, FetchError, ResultFetcher};
use crate::job::{AwaitOptions, JobController, JobError, JobEvents, JobReport, MemoryJobStore};
use crate::marketplace::{Endpoint, InstanceSpec, Marketplace, Offer, OfferQuery};
use crate::poll::{Clock, PollPolicy, TokioClock};
use crate::provision::{ProvisionError, ProvisionedInstance, Provisioner};
use crate::ranking::{RankingPolicy, rank};
use crate::readiness::{ReadinessError, ReadinessProber};
use crate::service::{JobRequest, ServiceConnector, ServiceError};
use crate::teardown::{TeardownGuard, TeardownOutcome};

/// Errors surfaced while performing a run.
///
/// `Display` and `Error` are written out by hand because
/// [`RunError::WithTeardownFailure`] nests another `RunError`.
#[derive(Debug)]
pub enum RunError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the offer search fails.
    Offers(E),
    /// Raised when no offer could be rented.
    NoCapacity {
        /// Offers tried before giving up.
        attempts: usize,
    },
    /// Raised when instance creation fails for a reason other than capacity.
    Provision {
        /// Offer being accepted.
        offer_id: String,
        /// Underlying gateway error.
        source: E,
    },
    /// Raised when the instance never became usable.
    Readiness {
        /// Instance being probed.
        instance_id: String,
        /// Underlying readiness failure.
        source: ReadinessError<E>,
    },
    /// Raised when no service client can be built for the endpoint.
    Connect {
        /// Endpoint returned by the readiness probe.
        endpoint: Endpoint,
        /// Underlying client error.
        source: ServiceError,
    },
    /// Raised when the job cannot be submitted or does not succeed.
    Job(JobError),
    /// Raised when the result cannot be downloaded.
    Fetch(FetchError),
    /// Raised when the run was interrupted.
    Interrupted {
        /// Instance that had been created, if any.
        instance_id: Option<String>,
    },
    /// Raised when teardown fails after the run itself succeeded.
    Teardown {
        /// Instance that could not be destroyed.
        instance_id: String,
        /// Underlying gateway error.
        source: E,
    },
    /// Raised when the run failed and teardown failed as well.
    WithTeardownFailure {
        /// The failure that ended the run.
        primary: Box<RunError<E>>,
        /// Instance that could not be destroyed.
        instance_id: String,
        /// Teardown failure.
        teardown: E,
    },
}

impl<E> fmt::Display for RunError<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offers(source) => write!(f, "failed to search offers: {source}"),
            Self::NoCapacity { attempts } => {
                write!(f, "no capacity available after {attempts} attempt(s)")
            }
            Self::Provision { offer_id, source } => {
                write!(f, "failed to create instance from offer {offer_id}: {source}")
            }
            Self::Readiness {
                instance_id,
                source,
            } => write!(f, "instance {instance_id} not usable: {source}"),
            Self::Connect { endpoint, source } => {
                write!(f, "failed to connect to {endpoint}: {source}")
            }
            Self::Job(err) => fmt::Display::fmt(err, f),
            Self::Fetch(err) => fmt::Display::fmt(err, f),
            Self::Interrupted { .. } => f.write_str("run interrupted"),
            Self::Teardown {
                instance_id,
                source,
            } => write!(f, "failed to destroy instance {instance_id}: {source}"),
            Self::WithTeardownFailure {
                primary,
                instance_id,
                teardown,
            } => write!(
                f,
                "{primary} (teardown also failed for {instance_id}: {teardown})"
            ),
        }
    }
}

impl<E> std::error::Error for RunError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Offers(source)
            | Self::Provision { source, .. }
            | Self::Teardown { source, .. } => Some(source),
            Self::Readiness { source, .. } => Some(source),
            Self::Connect { source, .. } => Some(source),
            Self::Job(err) => std::error::Error::source(err),
            Self::Fetch(err) => std::error::Error::source(err),
            Self::WithTeardownFailure { primary, .. } => Some(primary.as_ref()),
            Self::NoCapacity { .. } | Self::Interrupted { .. } => None,
        }
    }
}

impl<E> From<JobError> for RunError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: JobError) -> Self {
        Self::Job(value)
    }
}

impl<E> From<FetchError> for RunError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: FetchError) -> Self {
        Self::Fetch(value)
    }
}

impl<E> RunError<E>
where
    E: std::error::Error + 'static,
{
    /// Reports whether the run ended because of an interrupt.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted { .. } => true,
            Self::WithTeardownFailure { primary, .. } => primary.is_interrupted(),
            _ => false,
        }
    }
}

impl<E> From<ProvisionError<E>> for RunError<E>
where
    E: std::error::Error + 'static,
{
    fn from(value: ProvisionError<E>) -> Self {
        match value {
            ProvisionError::NoCapacity { attempts } => Self::NoCapacity { attempts },
            ProvisionError::Stopped { .. } => Self::Interrupted { instance_id: None },
            ProvisionError::Gateway { offer_id, source } => Self::Provision { offer_id, source },
        }
    }
}

/// Tunables shared by every run of an orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSettings {
    /// Marketplace search filters.
    pub query: OfferQuery,
    /// Ranking applied to the search result.
    pub ranking: RankingPolicy,
    /// Instance template; the offer id is filled in per attempt.
    pub template: InstanceSpec,
    /// Readiness polling.
    pub readiness: PollPolicy,
    /// Model warm-up polling; `None` skips the wait.
    pub models: Option<PollPolicy>,
    /// Job polling and log streaming.
    pub job: AwaitOptions,
}

impl RunSettings {
    /// Creates settings with default polling, filters, and ranking.
    #[must_use]
    pub fn new(template: InstanceSpec) -> Self {
        Self {
            query: OfferQuery::default(),
            ranking: RankingPolicy::default(),
            template,
            readiness: PollPolicy::readiness(),
            models: Some(PollPolicy::models()),
            job: AwaitOptions::default(),
        }
    }
}

/// One separation run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    /// Job submitted to the service.
    pub job: JobRequest,
    /// Artefact to download once the job completes.
    pub artifact: String,
    /// Local path the artefact is written to.
    pub destination: Utf8PathBuf,
    /// Leave the instance running after the run.
    pub keep_instance: bool,
}

impl RunRequest {
    /// Creates a request downloading the default artefact to `destination`.
    #[must_use]
    pub fn new(input_url: impl Into<String>, destination: impl Into<Utf8PathBuf>) -> Self {
        Self {
            job: JobRequest::new(input_url),
            artifact: String::from(DEFAULT_ARTIFACT),
            destination: destination.into(),
            keep_instance: false,
        }
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// Instance that ran the job.
    pub instance_id: String,
    /// Offer the instance was rented from.
    pub offer: Offer,
    /// Create calls needed to obtain the instance.
    pub attempts: usize,
    /// Service endpoint used.
    pub endpoint: Endpoint,
    /// Job summary.
    pub job: JobReport,
    /// Where the artefact was written.
    pub artifact_path: Utf8PathBuf,
    /// What happened to the instance afterwards.
    pub teardown: TeardownOutcome,
}

struct WorkOutcome {
    endpoint: Endpoint,
    job: JobReport,
    artifact_path: Utf8PathBuf,
}

/// Coordinates the marketplace, the service, and teardown for single runs.
#[derive(Debug)]
pub struct RunOrchestrator<M, S, C = TokioClock> {
    gateway: M,
    connector: S,
    clock: C,
    settings: RunSettings,
    store: MemoryJobStore,
}

impl<M, S> RunOrchestrator<M, S>
where
    M: Marketplace,
    S: ServiceConnector,
{
    /// Creates an orchestrator running against real time.
    #[must_use]
    pub fn new(gateway: M, connector: S, settings: RunSettings) -> Self {
        Self::with_clock(gateway, connector, TokioClock, settings)
    }
}

impl<M, S, C> RunOrchestrator<M, S, C>
where
    M: Marketplace,
    S: ServiceConnector,
    C: Clock,
{
    /// Creates an orchestrator with an explicit clock.
    #[must_use]
    pub fn with_clock(gateway: M, connector: S, clock: C, settings: RunSettings) -> Self {
        Self {
            gateway,
            connector,
            clock,
            settings,
            store: MemoryJobStore::new(),
        }
    }

    /// Local job records written during runs.
    #[must_use]
    pub const fn store(&self) -> &MemoryJobStore {
        &self.store
    }

    /// Runs one job end to end.
    ///
    /// `shutdown` resolves when the caller wants the run abandoned. An
    /// in-flight create call is allowed to finish so the instance it
    /// produced can be destroyed, but no further offers are tried; after
    /// that the interrupt ends the run.
    ///
    /// # Errors
    ///
    /// Returns the first failure. When teardown fails as well the teardown
    /// error is attached via [`RunError::WithTeardownFailure`]; a teardown
    /// failure after an otherwise successful run is [`RunError::Teardown`].
    pub async fn execute<E, F>(
        &self,
        request: &RunRequest,
        events: &mut E,
        shutdown: F,
    ) -> Result<RunReport, RunError<M::Error>>
    where
        E: JobEvents + Send + ?Sized,
        F: Future<Output = ()>,
    {
        let mut interrupt = pin!(shutdown);

        let offers = tokio::select! {
            biased;
            () = &mut interrupt => return Err(RunError::Interrupted { instance_id: None }),
            found = self.gateway.search_offers(&self.settings.query) => {
                found.map_err(RunError::Offers)?
            }
        };
        let ranked = rank(&offers, &self.settings.ranking);
        info!(found = offers.len(), ranked = ranked.len(), "offers ranked");

        let stop = AtomicBool::new(false);
        let provisioner = Provisioner::new(&self.gateway).stop_when(&stop);
        let mut provisioning = pin!(provisioner.provision(&ranked, &self.settings.template));
        let (provision_outcome, interrupted) = tokio::select! {
            biased;
            outcome = provisioning.as_mut() => (outcome, false),
            () = &mut interrupt => {
                stop.store(true, Ordering::SeqCst);
                warn!("interrupt received; finishing the in-flight create call only");
                (provisioning.as_mut().await, true)
            }
        };
        let provisioned = match provision_outcome {
            Ok(provisioned) => provisioned,
            Err(_) if interrupted => return Err(RunError::Interrupted { instance_id: None }),
            Err(err) => return Err(err.into()),
        };

        let ProvisionedInstance {
            instance_id,
            offer,
            attempts,
        } = provisioned;
        info!(
            %instance_id,
            offer_id = %offer.id,
            gpu = %offer.gpu_name,
            price_per_hour = offer.price_per_hour,
            attempts,
            "instance provisioned"
        );
        let guard = TeardownGuard::arm(&instance_id, request.keep_instance);

        let outcome = if interrupted {
            Err(RunError::Interrupted {
                instance_id: Some(instance_id.clone()),
            })
        } else {
            tokio::select! {
                biased;
                () = &mut interrupt => {
                    warn!(%instance_id, "interrupt received; tearing down");
                    Err(RunError::Interrupted { instance_id: Some(instance_id.clone()) })
                }
                work = self.work(&instance_id, request, events) => work,
            }
        };

        let teardown = guard.release(&self.gateway).await;
        match (outcome, teardown) {
            (Ok(work), Ok(teardown)) => Ok(RunReport {
                instance_id,
                offer,
                attempts,
                endpoint: work.endpoint,
                job: work.job,
                artifact_path: work.artifact_path,
                teardown,
            }),
            (Ok(_), Err(source)) => {
                error!(%instance_id, error = %source, "teardown failed after a successful run");
                Err(RunError::Teardown {
                    instance_id,
                    source,
                })
            }
            (Err(primary), Ok(_)) => Err(primary),
            (Err(primary), Err(teardown)) => {
                error!(%instance_id, error = %teardown, "teardown failed after a failed run");
                Err(RunError::WithTeardownFailure {
                    primary: Box::new(primary),
                    instance_id,
                    teardown,
                })
            }
        }
    }

    async fn work<E>(
        &self,
        instance_id: &str,
        request: &RunRequest,
        events: &mut E,
    ) -> Result<WorkOutcome, RunError<M::Error>>
    where
        E: JobEvents + Send + ?Sized,
    {
        let readiness_failed = |source| RunError::Readiness {
            instance_id: instance_id.to_owned(),
            source,
        };
        let prober = ReadinessProber::new(
            &self.gateway,
            &self.connector,
            &self.clock,
            self.settings.template.service_port,
        );
        let endpoint = prober
            .wait_ready(instance_id, self.settings.readiness)
            .await
            .map_err(readiness_failed)?;
        if let Some(policy) = self.settings.models {
            prober
                .wait_models_ready(&endpoint, policy)
                .await
                .map_err(readiness_failed)?;
        }

        let service = self
            .connector
            .connect(&endpoint)
            .map_err(|source| RunError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        let controller = JobController::new(&service, &self.store, &self.clock);
        let job_id = controller.submit(&request.job).await?;
        let job = controller
            .await_completion(&job_id, self.settings.job, events)
            .await?;
        let artifact_path = ResultFetcher::new(&service, &self.store)
            .fetch(&job_id, &request.artifact, &request.destination)
            .await?;

        Ok(WorkOutcome {
            endpoint,
            job,
            artifact_path,
        })
    }
}

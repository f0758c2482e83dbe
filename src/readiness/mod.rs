//! Readiness probing for freshly created instances.
//!
//! An instance is ready once the marketplace reports it running, a public
//! mapping exists for the service port, and the service answers its health
//! probe. A second, optional wait covers model warm-up inside the service.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::marketplace::{Endpoint, InstanceStatus, Marketplace};
use crate::poll::{Clock, Deadline, PollPolicy};
use crate::service::{JobService, ServiceConnector, ServiceError};

/// Errors raised while waiting for an instance.
#[derive(Debug, Error)]
pub enum ReadinessError<E>
where
    E: std::error::Error + 'static,
{
    /// The instance did not become reachable in time.
    #[error("instance {instance_id} not ready after {}s", elapsed.as_secs())]
    Timeout {
        /// Instance being probed.
        instance_id: String,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The service never reported its models as loaded.
    #[error("models on {endpoint} not ready after {}s", elapsed.as_secs())]
    ModelsTimeout {
        /// Service endpoint being probed.
        endpoint: Endpoint,
        /// Time spent waiting.
        elapsed: Duration,
    },
    /// The marketplace reported the instance as destroyed.
    #[error("instance {instance_id} disappeared while waiting for readiness")]
    Gone {
        /// Instance being probed.
        instance_id: String,
    },
    /// The marketplace failed while reading instance state.
    #[error("failed to read instance state: {0}")]
    Gateway(#[source] E),
    /// A service client could not be constructed.
    #[error("failed to reach separation service: {0}")]
    Service(#[source] ServiceError),
}

/// Polls an instance until its service is reachable.
#[derive(Debug)]
pub struct ReadinessProber<'a, M, S, C: ?Sized> {
    gateway: &'a M,
    connector: &'a S,
    clock: &'a C,
    service_port: u16,
}

impl<'a, M, S, C> ReadinessProber<'a, M, S, C>
where
    M: Marketplace,
    S: ServiceConnector,
    C: Clock + ?Sized,
{
    /// Creates a prober for instances exposing `service_port`.
    #[must_use]
    pub const fn new(gateway: &'a M, connector: &'a S, clock: &'a C, service_port: u16) -> Self {
        Self {
            gateway,
            connector,
            clock,
            service_port,
        }
    }

    /// Waits until the instance is running, mapped, and healthy.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] when the bound elapses,
    /// [`ReadinessError::Gone`] when the instance is destroyed underneath
    /// the wait, and [`ReadinessError::Gateway`] on the first gateway
    /// failure.
    pub async fn wait_ready(
        &self,
        instance_id: &str,
        policy: PollPolicy,
    ) -> Result<Endpoint, ReadinessError<M::Error>> {
        let deadline = Deadline::after(self.clock, policy.timeout);
        while !deadline.expired(self.clock.now()) {
            let snapshot = self
                .gateway
                .get_instance(instance_id)
                .await
                .map_err(ReadinessError::Gateway)?;
            match snapshot.status {
                InstanceStatus::Destroyed => {
                    return Err(ReadinessError::Gone {
                        instance_id: instance_id.to_owned(),
                    });
                }
                InstanceStatus::Running => {
                    if let Some(endpoint) = snapshot.endpoint_for(self.service_port) {
                        if self.probe_health(&endpoint).await? {
                            info!(
                                %instance_id,
                                %endpoint,
                                elapsed_secs = deadline.elapsed(self.clock.now()).as_secs(),
                                "instance ready"
                            );
                            return Ok(endpoint);
                        }
                    } else {
                        debug!(%instance_id, port = self.service_port, "port mapping not published yet");
                    }
                }
                InstanceStatus::Unreachable => {
                    warn!(%instance_id, "instance reported unreachable");
                }
                InstanceStatus::Creating => {
                    debug!(%instance_id, "instance still creating");
                }
            }
            self.clock.sleep(policy.interval).await;
        }
        Err(ReadinessError::Timeout {
            instance_id: instance_id.to_owned(),
            elapsed: deadline.elapsed(self.clock.now()),
        })
    }

    /// Waits until the service reports its models as loaded.
    ///
    /// Status failures are logged and retried; the service may restart
    /// while unpacking models.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::ModelsTimeout`] when the bound elapses and
    /// [`ReadinessError::Service`] when no client can be built.
    pub async fn wait_models_ready(
        &self,
        endpoint: &Endpoint,
        policy: PollPolicy,
    ) -> Result<(), ReadinessError<M::Error>> {
        let service = self
            .connector
            .connect(endpoint)
            .map_err(ReadinessError::Service)?;
        let deadline = Deadline::after(self.clock, policy.timeout);
        while !deadline.expired(self.clock.now()) {
            match service.status().await {
                Ok(status) if status.models_ready => {
                    info!(%endpoint, "models ready");
                    return Ok(());
                }
                Ok(_) => debug!(%endpoint, "models still loading"),
                Err(err) => warn!(%endpoint, error = %err, "status probe failed"),
            }
            self.clock.sleep(policy.interval).await;
        }
        Err(ReadinessError::ModelsTimeout {
            endpoint: endpoint.clone(),
            elapsed: deadline.elapsed(self.clock.now()),
        })
    }

    async fn probe_health(&self, endpoint: &Endpoint) -> Result<bool, ReadinessError<M::Error>> {
        let service = self
            .connector
            .connect(endpoint)
            .map_err(ReadinessError::Service)?;
        match service.health().await {
            Ok(()) => Ok(true),
            Err(err) => {
                debug!(%endpoint, error = %err, "health probe failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests;

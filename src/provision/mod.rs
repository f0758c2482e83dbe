//! Provisioning with capacity fallback.
//!
//! Walks a ranked offer list and accepts the first offer the marketplace
//! will actually rent. Offers that vanished between search and create are
//! skipped; every other failure stops the walk.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use crate::marketplace::{Classify, InstanceSpec, Marketplace, Offer};

/// A created instance together with the offer that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionedInstance {
    /// Identifier assigned by the marketplace.
    pub instance_id: String,
    /// Offer that was accepted.
    pub offer: Offer,
    /// Number of create calls made, including the successful one.
    pub attempts: usize,
}

/// Errors raised while provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError<E>
where
    E: std::error::Error + 'static,
{
    /// Every candidate offer reported capacity unavailable.
    #[error("no capacity available after {attempts} attempt(s)")]
    NoCapacity {
        /// Number of offers tried.
        attempts: usize,
    },
    /// The stop flag was raised before another create call was made.
    #[error("provisioning stopped after {attempts} attempt(s)")]
    Stopped {
        /// Create calls made before stopping.
        attempts: usize,
    },
    /// A non-capacity failure stopped provisioning.
    #[error("failed to create instance from offer {offer_id}: {source}")]
    Gateway {
        /// Offer being accepted when the failure occurred.
        offer_id: String,
        /// Underlying gateway error.
        #[source]
        source: E,
    },
}

/// Creates instances by walking ranked offers in order.
#[derive(Debug)]
pub struct Provisioner<'a, M> {
    gateway: &'a M,
    stop: Option<&'a AtomicBool>,
}

impl<'a, M> Provisioner<'a, M>
where
    M: Marketplace,
{
    /// Creates a provisioner over a gateway.
    #[must_use]
    pub const fn new(gateway: &'a M) -> Self {
        Self {
            gateway,
            stop: None,
        }
    }

    /// Checks `flag` before every create call and stops once it is set.
    ///
    /// A create call already in flight is never abandoned.
    #[must_use]
    pub const fn stop_when(self, flag: &'a AtomicBool) -> Self {
        Self {
            gateway: self.gateway,
            stop: Some(flag),
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Tries each offer in order until one instance is created.
    ///
    /// At most one instance is created per call. The template's offer id is
    /// replaced by each candidate's id in turn.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoCapacity`] when the list is empty or every
    /// offer was unavailable, [`ProvisionError::Stopped`] once the stop flag
    /// is raised, and [`ProvisionError::Gateway`] on the first failure that
    /// is not capacity related.
    pub async fn provision(
        &self,
        ranked: &[Offer],
        template: &InstanceSpec,
    ) -> Result<ProvisionedInstance, ProvisionError<M::Error>> {
        let mut attempts = 0_usize;
        for offer in ranked {
            if self.stop_requested() {
                info!(attempts, "provisioning stopped");
                return Err(ProvisionError::Stopped { attempts });
            }
            attempts = attempts.saturating_add(1);
            let spec = template.for_offer(&offer.id);
            info!(
                offer_id = %offer.id,
                gpu = %offer.gpu_name,
                price_per_hour = offer.price_per_hour,
                attempt = attempts,
                "creating instance"
            );
            match self.gateway.create_instance(&spec).await {
                Ok(instance_id) => {
                    info!(%instance_id, offer_id = %offer.id, attempt = attempts, "instance created");
                    return Ok(ProvisionedInstance {
                        instance_id,
                        offer: offer.clone(),
                        attempts,
                    });
                }
                Err(err) if err.is_capacity_unavailable() => {
                    warn!(offer_id = %offer.id, error = %err, "offer unavailable, trying next");
                }
                Err(err) => {
                    return Err(ProvisionError::Gateway {
                        offer_id: offer.id.clone(),
                        source: err,
                    });
                }
            }
        }
        Err(ProvisionError::NoCapacity { attempts })
    }
}

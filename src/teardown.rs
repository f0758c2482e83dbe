//! Scoped ownership of a paid instance.
//!
//! A [`TeardownGuard`] is armed as soon as an instance exists and must be
//! released on every exit path. Dropping a guard that is still armed does
//! not destroy anything (destruction is asynchronous) but logs the leaked
//! instance so it can be cleaned up by hand.

use tracing::{error, info, warn};

use crate::marketplace::Marketplace;

/// What [`TeardownGuard::release`] did with the instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TeardownOutcome {
    /// The instance was destroyed.
    Destroyed,
    /// The instance was kept running on request.
    Retained,
}

/// Owns an instance until it is explicitly released.
#[derive(Debug)]
pub struct TeardownGuard {
    instance_id: String,
    keep: bool,
    armed: bool,
}

impl TeardownGuard {
    /// Arms a guard for `instance_id`. With `keep` set, release leaves the
    /// instance running.
    #[must_use]
    pub fn arm(instance_id: impl Into<String>, keep: bool) -> Self {
        Self {
            instance_id: instance_id.into(),
            keep,
            armed: true,
        }
    }

    /// Instance owned by the guard.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Destroys the instance unless it is being kept, and disarms the guard.
    ///
    /// # Errors
    ///
    /// Returns the gateway error when destruction fails. The guard is
    /// disarmed either way; the failure is the caller's to report.
    pub async fn release<M: Marketplace + ?Sized>(
        mut self,
        gateway: &M,
    ) -> Result<TeardownOutcome, M::Error> {
        self.armed = false;
        if self.keep {
            warn!(instance_id = %self.instance_id, "keeping instance; destroy it manually when done");
            return Ok(TeardownOutcome::Retained);
        }
        info!(instance_id = %self.instance_id, "destroying instance");
        gateway.destroy_instance(&self.instance_id).await?;
        info!(instance_id = %self.instance_id, "instance destroyed");
        Ok(TeardownOutcome::Destroyed)
    }
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if self.armed && !self.keep {
            error!(
                instance_id = %self.instance_id,
                "instance leaked without teardown; destroy it manually"
            );
        }
    }
}

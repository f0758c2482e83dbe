//! Batch launches for capacity testing, and the matching cleanup pass.
//!
//! A [`FleetLauncher`] ranks offers once and then creates instances one at a
//! time, cycling through that fixed list. Every instance it creates ends up
//! in the [`InstanceRegistry`], including when the batch is interrupted, so
//! [`destroy_all`] can find it later from another process.

use std::future::Future;
use std::pin::pin;

use camino::Utf8PathBuf;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::marketplace::{InstanceSpec, Marketplace, Offer, OfferQuery};
use crate::ranking::{RankingPolicy, rank};
use crate::registry::{InstanceRecord, InstanceRegistry, RegistryError};

/// Label prefix applied to fleet instances when none is configured.
pub const DEFAULT_LABEL_PREFIX: &str = "stemrig-fleet";

/// Ranking depth used for fleets; wider than a single run to spread load.
pub const DEFAULT_FLEET_OFFERS: usize = 20;

/// Errors raised by fleet operations.
#[derive(Debug, Error)]
pub enum FleetError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when the offer search fails.
    #[error("failed to search offers: {0}")]
    Offers(#[source] E),
    /// Raised when no offer survives ranking.
    #[error("no GPU offers available")]
    NoOffers,
    /// Raised when destroy-all finds no registry file.
    #[error("{path} not found; no active instances to destroy")]
    NoRegistry {
        /// Registry location that was checked.
        path: Utf8PathBuf,
    },
    /// Raised when the registry cannot be read or written.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// How [`destroy_all`] treats the registry file afterwards.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ClearPolicy {
    /// Keep records whose destroy failed; delete the file once none remain.
    #[default]
    RetainFailed,
    /// Delete the file after the pass whatever the individual outcomes.
    ClearAll,
}

/// Inputs shared by every launch of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct FleetSettings {
    /// Marketplace search filters.
    pub query: OfferQuery,
    /// Ranking applied once before the batch.
    pub ranking: RankingPolicy,
    /// Instance template; offer id and label are set per launch.
    pub template: InstanceSpec,
    /// Prefix of per-launch labels (`<prefix>-07`).
    pub label_prefix: String,
}

impl FleetSettings {
    /// Creates settings with default filters and a 20-offer ranking.
    #[must_use]
    pub fn new(template: InstanceSpec) -> Self {
        Self {
            query: OfferQuery::default(),
            ranking: RankingPolicy {
                max_results: DEFAULT_FLEET_OFFERS,
                ..RankingPolicy::default()
            },
            template,
            label_prefix: String::from(DEFAULT_LABEL_PREFIX),
        }
    }
}

/// Tally of a launch batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LaunchSummary {
    /// Create calls made.
    pub attempted: usize,
    /// Instances created.
    pub succeeded: usize,
    /// Create calls that failed.
    pub failed: usize,
    /// Records persisted for the created instances.
    pub records: Vec<InstanceRecord>,
    /// Whether the batch stopped early on an interrupt.
    pub interrupted: bool,
}

/// Tally of a destroy-all pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DestroySummary {
    /// Records found in the registry.
    pub attempted: usize,
    /// Instances destroyed.
    pub destroyed: usize,
    /// Records whose destroy failed.
    pub failed: Vec<InstanceRecord>,
    /// Whether the registry file was deleted.
    pub registry_cleared: bool,
}

/// Sequential batch launcher over a fixed ranked offer list.
#[derive(Debug)]
pub struct FleetLauncher<'a, M> {
    gateway: &'a M,
    registry: &'a InstanceRegistry,
    settings: FleetSettings,
    offers: Vec<Offer>,
}

impl<'a, M> FleetLauncher<'a, M>
where
    M: Marketplace,
{
    /// Searches and ranks offers once for the whole batch.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Offers`] when the search fails and
    /// [`FleetError::NoOffers`] when nothing survives ranking.
    pub async fn prepare(
        gateway: &'a M,
        registry: &'a InstanceRegistry,
        settings: FleetSettings,
    ) -> Result<Self, FleetError<M::Error>> {
        let found = gateway
            .search_offers(&settings.query)
            .await
            .map_err(FleetError::Offers)?;
        let offers = rank(&found, &settings.ranking);
        if offers.is_empty() {
            return Err(FleetError::NoOffers);
        }
        info!(found = found.len(), ranked = offers.len(), "fleet offers ranked");
        Ok(Self {
            gateway,
            registry,
            settings,
            offers,
        })
    }

    /// Ranked offers the batch cycles through.
    #[must_use]
    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    /// Launches up to `count` instances, one after another.
    ///
    /// Launch `i` uses offer `i mod len`. A failed create is counted and the
    /// batch moves on. When `shutdown` resolves, the create in flight is
    /// allowed to finish and the remaining launches are skipped. Records
    /// are appended to the registry in either case.
    ///
    /// # Errors
    ///
    /// Returns [`FleetError::Registry`] when the records cannot be
    /// persisted; the affected instance ids are logged first.
    pub async fn launch<F>(
        &self,
        count: usize,
        shutdown: F,
    ) -> Result<LaunchSummary, FleetError<M::Error>>
    where
        F: Future<Output = ()>,
    {
        let mut interrupt = pin!(shutdown);
        let mut summary = LaunchSummary::default();

        for index in 0..count {
            let stop_now = tokio::select! {
                biased;
                () = &mut interrupt => true,
                () = std::future::ready(()) => false,
            };
            if stop_now {
                summary.interrupted = true;
                break;
            }
            let Some(offer) = index
                .checked_rem(self.offers.len())
                .and_then(|slot| self.offers.get(slot))
            else {
                break;
            };

            let spec = self
                .settings
                .template
                .for_offer(&offer.id)
                .with_label(format!("{}-{index:02}", self.settings.label_prefix));
            let mut create = pin!(self.gateway.create_instance(&spec));
            let (outcome, interrupted) = tokio::select! {
                biased;
                outcome = create.as_mut() => (outcome, false),
                () = &mut interrupt => {
                    warn!(index, "interrupt received; waiting for the pending create call");
                    (create.as_mut().await, true)
                }
            };

            summary.attempted = summary.attempted.saturating_add(1);
            match outcome {
                Ok(instance_id) => {
                    info!(index, %instance_id, offer_id = %offer.id, gpu = %offer.gpu_name, "fleet instance launched");
                    summary.succeeded = summary.succeeded.saturating_add(1);
                    summary.records.push(InstanceRecord {
                        index,
                        instance_id,
                        offer_id: offer.id.clone(),
                        gpu_name: offer.gpu_name.clone(),
                        price_per_hour: offer.price_per_hour,
                        created_at: Utc::now(),
                    });
                }
                Err(err) => {
                    warn!(index, offer_id = %offer.id, error = %err, "fleet launch failed");
                    summary.failed = summary.failed.saturating_add(1);
                }
            }
            if interrupted {
                summary.interrupted = true;
                break;
            }
        }

        if !summary.records.is_empty() {
            if let Err(err) = self.registry.append(&summary.records) {
                for record in &summary.records {
                    error!(instance_id = %record.instance_id, "instance not recorded; destroy it manually");
                }
                return Err(err.into());
            }
            info!(
                path = %self.registry.path(),
                count = summary.records.len(),
                "fleet instances recorded"
            );
        }
        Ok(summary)
    }
}

/// Destroys every recorded instance, each independently of the others.
///
/// An empty registry is left untouched. Otherwise the file is rewritten or
/// deleted according to `policy`.
///
/// # Errors
///
/// Returns [`FleetError::NoRegistry`] when the file does not exist and
/// [`FleetError::Registry`] when it cannot be read or updated.
pub async fn destroy_all<M>(
    gateway: &M,
    registry: &InstanceRegistry,
    policy: ClearPolicy,
) -> Result<DestroySummary, FleetError<M::Error>>
where
    M: Marketplace + ?Sized,
{
    let records = registry.load()?.ok_or_else(|| FleetError::NoRegistry {
        path: registry.path().to_path_buf(),
    })?;
    let mut summary = DestroySummary {
        attempted: records.len(),
        ..DestroySummary::default()
    };
    if records.is_empty() {
        info!(path = %registry.path(), "registry is empty");
        return Ok(summary);
    }

    for record in records {
        match gateway.destroy_instance(&record.instance_id).await {
            Ok(()) => {
                info!(index = record.index, instance_id = %record.instance_id, "fleet instance destroyed");
                summary.destroyed = summary.destroyed.saturating_add(1);
            }
            Err(err) => {
                warn!(index = record.index, instance_id = %record.instance_id, error = %err, "destroy failed");
                summary.failed.push(record);
            }
        }
    }

    match policy {
        ClearPolicy::RetainFailed if !summary.failed.is_empty() => {
            registry.save(&summary.failed)?;
            warn!(
                path = %registry.path(),
                remaining = summary.failed.len(),
                "registry keeps instances that could not be destroyed"
            );
        }
        ClearPolicy::RetainFailed | ClearPolicy::ClearAll => {
            summary.registry_cleared = registry.remove()?;
        }
    }
    Ok(summary)
}

//! Offer ranking.
//!
//! Filters marketplace offers by hardware floor, orders them by price, and
//! promotes a short list of preferred GPU models found among the cheapest
//! candidates.

use std::cmp::Ordering;

use crate::marketplace::Offer;

/// GPU models promoted when they appear among the cheapest offers, in
/// priority order.
pub const DEFAULT_PREFERRED_GPUS: [&str; 7] = [
    "RTX 3090",
    "RTX 4090",
    "RTX A4000",
    "RTX A5000",
    "A40",
    "RTX 3080",
    "RTX 4080",
];

/// Number of cheapest offers inspected for preferred models.
pub const DEFAULT_PREFERRED_WINDOW: usize = 10;

/// Ranking parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct RankingPolicy {
    /// Preferred GPU model substrings, highest priority first.
    pub preferred: Vec<String>,
    /// Offers with less VRAM are discarded.
    pub min_vram_gb: f64,
    /// Offers with a lower reliability score are discarded.
    pub min_reliability: f64,
    /// Maximum length of the ranking.
    pub max_results: usize,
    /// Number of cheapest offers scanned for preferred models.
    pub preferred_window: usize,
}

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            preferred: DEFAULT_PREFERRED_GPUS
                .iter()
                .map(|model| (*model).to_owned())
                .collect(),
            min_vram_gb: 8.0,
            min_reliability: 0.9,
            max_results: 5,
            preferred_window: DEFAULT_PREFERRED_WINDOW,
        }
    }
}

fn compare_price(lhs: &Offer, rhs: &Offer) -> Ordering {
    match (lhs.price_per_hour.is_nan(), rhs.price_per_hour.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => lhs.price_per_hour.total_cmp(&rhs.price_per_hour),
    }
}

fn matches_model(offer: &Offer, model: &str) -> bool {
    offer
        .gpu_name
        .to_ascii_lowercase()
        .contains(&model.to_ascii_lowercase())
}

/// Produces an ordered candidate list from raw offers.
///
/// Offers failing the VRAM or reliability floor are dropped, the rest are
/// sorted by hourly price (stable, `NaN` last). Within the cheapest
/// `preferred_window` offers each preferred model claims its first match in
/// priority order; claimed offers lead the ranking, followed by every other
/// offer in price order. The result holds at most `max_results` entries and
/// never contains an offer twice.
#[must_use]
pub fn rank(offers: &[Offer], policy: &RankingPolicy) -> Vec<Offer> {
    let mut eligible: Vec<&Offer> = offers
        .iter()
        .filter(|offer| {
            offer.vram_gb >= policy.min_vram_gb && offer.reliability >= policy.min_reliability
        })
        .collect();
    eligible.sort_by(|lhs, rhs| compare_price(lhs, rhs));

    let window = policy.preferred_window.min(eligible.len());
    let mut claimed = vec![false; eligible.len()];
    let mut ranked: Vec<Offer> = Vec::with_capacity(eligible.len());

    for model in &policy.preferred {
        let pick = eligible
            .iter()
            .take(window)
            .enumerate()
            .find(|(idx, offer)| {
                !claimed.get(*idx).copied().unwrap_or(true) && matches_model(offer, model)
            })
            .map(|(idx, _)| idx);
        if let Some(idx) = pick {
            if let (Some(slot), Some(offer)) = (claimed.get_mut(idx), eligible.get(idx)) {
                *slot = true;
                ranked.push((*offer).clone());
            }
        }
    }

    ranked.extend(
        eligible
            .iter()
            .zip(claimed.iter())
            .filter(|(_, taken)| !**taken)
            .map(|(offer, _)| (*offer).clone()),
    );
    ranked.truncate(policy.max_results);
    ranked
}

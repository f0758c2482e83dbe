//! Fixed-interval polling policy and the clock it runs against.
//!
//! Every wait loop in the crate follows the same shape: compute a deadline,
//! check a condition, sleep for the interval, repeat until the deadline
//! passes. The [`Clock`] trait lets tests drive those loops with virtual
//! time.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

/// Interval and overall bound for a polling loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollPolicy {
    /// Delay between consecutive checks.
    pub interval: Duration,
    /// Total time allowed before the loop gives up.
    pub timeout: Duration,
}

impl PollPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Instance readiness: 10 second interval, 10 minute bound.
    #[must_use]
    pub const fn readiness() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(600))
    }

    /// Model warm-up: 5 second interval, 5 minute bound.
    #[must_use]
    pub const fn models() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }

    /// Job completion: 5 second interval, 30 minute bound.
    #[must_use]
    pub const fn job() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(1800))
    }
}

/// Deadline measured against a [`Clock`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Deadline {
    started: Instant,
    expires: Option<Instant>,
}

impl Deadline {
    /// Starts a deadline `timeout` from the clock's current instant.
    ///
    /// A timeout too large to represent never expires.
    #[must_use]
    pub fn after<C: Clock + ?Sized>(clock: &C, timeout: Duration) -> Self {
        let started = clock.now();
        Self {
            started,
            expires: started.checked_add(timeout),
        }
    }

    /// Returns `true` once `now` is past the deadline.
    #[must_use]
    pub fn expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|expires| now > expires)
    }

    /// Time elapsed between the start and `now`.
    #[must_use]
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }
}

/// Future returned by [`Clock::sleep`].
pub type SleepFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Source of time for polling loops.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;

    /// Suspends for the given duration.
    fn sleep(&self, duration: Duration) -> SleepFuture<'_>;
}

/// Wall clock backed by the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        Box::pin(tokio::time::sleep(duration))
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        (**self).sleep(duration)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration) -> SleepFuture<'_> {
        (**self).sleep(duration)
    }
}

//! Deterministic clock and RNG seams for tests.
//!
//! Production code reads time through [`Clock`] and jitter through
//! [`Jitter`] rather than calling `Utc::now()`/`rand::thread_rng()`
//! directly, so tests can pin both without sleeping in wall-clock time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;

/// A source of "now". The default implementation wraps `Utc::now()`;
/// tests use [`Clock::manual`] to advance time explicitly.
#[derive(Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

enum ClockInner {
    System,
    Manual(AtomicI64),
}

impl Clock {
    /// Real wall-clock time.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(ClockInner::System),
        }
    }

    /// A clock pinned to `start`, advanced only by [`Clock::advance`].
    pub fn manual(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(ClockInner::Manual(AtomicI64::new(start.timestamp_millis()))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &*self.inner {
            ClockInner::System => Utc::now(),
            ClockInner::Manual(millis) => {
                DateTime::from_timestamp_millis(millis.load(Ordering::SeqCst))
                    .unwrap_or_else(Utc::now)
            }
        }
    }

    /// Advance a manual clock. No-op on a system clock.
    pub fn advance(&self, delta: chrono::Duration) {
        if let ClockInner::Manual(millis) = &*self.inner {
            millis.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

/// A source of jitter for retry/backoff delays. Production code uses
/// [`Jitter::random`]; tests use [`Jitter::fixed`] to get reproducible
/// delay assertions -- the observed delay needs to lie in a
/// computable interval, which a random jitter source cannot be asserted
/// against directly without a seam like this one.
pub trait Jitter: Send + Sync {
    /// Return a value uniformly distributed in `[-1.0, 1.0]`.
    fn sample(&self) -> f64;
}

pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_only_when_told() {
        let start = Utc::now();
        let clock = Clock::manual(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[test]
    fn fixed_jitter_is_stable() {
        let j = FixedJitter(0.5);
        assert_eq!(j.sample(), 0.5);
        assert_eq!(j.sample(), 0.5);
    }
}

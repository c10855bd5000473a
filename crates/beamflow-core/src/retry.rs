//! Retry Policy.
//!
//! A pure function of attempt number and policy constants. It holds no
//! state and does not sleep; the Actor owns the sleep/wakeup.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Jitter, RandomJitter};
use crate::error::{Failure, FailureKind};

fn duration_millis<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_u64(d.as_millis() as u64)
}

fn duration_millis_de<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(d)?))
}

/// Outcome of consulting the Retry Policy for a failed invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp { reason: String },
}

/// Backoff schedule and attempt budget for one named policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(serialize_with = "duration_millis", deserialize_with = "duration_millis_de")]
    pub base: Duration,
    #[serde(serialize_with = "duration_millis", deserialize_with = "duration_millis_de")]
    pub max: Duration,
    /// Fraction in `[0, 1]`; the delay is jittered by `+/- jitter_pct * delay`.
    pub jitter_pct: f64,
}

impl RetryPolicy {
    /// default policy: base 1000ms, max 30000ms, jitter +/-25%, 5 attempts.
    pub fn default_policy() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter_pct: 0.25,
        }
    }

    /// More conservative: longer base, fewer attempts.
    pub fn payment() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(5_000),
            max: Duration::from_millis(60_000),
            jitter_pct: 0.10,
        }
    }

    /// More tolerant of flaky upstreams.
    pub fn external_api() -> Self {
        Self {
            max_attempts: 8,
            base: Duration::from_millis(500),
            max: Duration::from_millis(20_000),
            jitter_pct: 0.25,
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_base(mut self, d: Duration) -> Self {
        self.base = d;
        self
    }

    pub fn with_max(mut self, d: Duration) -> Self {
        self.max = d;
        self
    }

    pub fn with_jitter_pct(mut self, pct: f64) -> Self {
        self.jitter_pct = pct.clamp(0.0, 1.0);
        self
    }

    /// `delay = min(base * 2^(attempt-1), max)`, before jitter. `attempt`
    /// is 1-indexed; attempt 1 has no prior failure so its delay is zero.
    fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 1;
        let multiplier = 2u64.saturating_pow(retry_num.saturating_sub(1).min(32));
        let scaled = self.base.as_millis().saturating_mul(multiplier as u128);
        let capped = scaled.min(self.max.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Apply jitter via the given source, producing a value in
    /// `[base * (1 - jitter_pct), base * (1 + jitter_pct)]`.
    fn jittered(&self, base: Duration, jitter: &dyn Jitter) -> Duration {
        if self.jitter_pct <= 0.0 || base.is_zero() {
            return base;
        }
        let sample = jitter.sample().clamp(-1.0, 1.0);
        let delta_ms = base.as_millis() as f64 * self.jitter_pct * sample;
        let millis = (base.as_millis() as f64 + delta_ms).max(0.0);
        Duration::from_millis(millis as u64)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for_attempt_with(attempt, &RandomJitter)
    }

    pub fn delay_for_attempt_with(&self, attempt: u32, jitter: &dyn Jitter) -> Duration {
        let base = self.base_delay_for_attempt(attempt);
        self.jittered(base, jitter)
    }

    /// Decide whether a failed invocation should be retried, applying
    /// classification rules via `failure.kind`.
    pub fn decide(&self, failure: &Failure, attempt: u32) -> RetryDecision {
        if failure.kind != FailureKind::Transient {
            return RetryDecision::GiveUp {
                reason: failure.to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("exhausted {} attempts: {failure}", self.max_attempts),
            };
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempt + 1))
    }
}

/// A named set of policies, looked up by the names §4.4 uses in
/// examples (`default`, `payment`, `external_api`) plus any operator
/// overrides supplied via configuration.
#[derive(Clone)]
pub struct RetryPolicyBook {
    policies: std::collections::HashMap<String, Arc<RetryPolicy>>,
}

impl RetryPolicyBook {
    pub fn new() -> Self {
        let mut policies = std::collections::HashMap::new();
        policies.insert("default".to_string(), Arc::new(RetryPolicy::default_policy()));
        policies.insert("payment".to_string(), Arc::new(RetryPolicy::payment()));
        policies.insert(
            "external_api".to_string(),
            Arc::new(RetryPolicy::external_api()),
        );
        Self { policies }
    }

    pub fn register(&mut self, name: impl Into<String>, policy: RetryPolicy) {
        self.policies.insert(name.into(), Arc::new(policy));
    }

    pub fn get(&self, name: &str) -> Arc<RetryPolicy> {
        self.policies
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(RetryPolicy::default_policy()))
    }
}

impl Default for RetryPolicyBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedJitter;

    #[test]
    fn first_attempt_has_no_delay() {
        let p = RetryPolicy::default_policy();
        assert_eq!(p.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn delay_doubles_then_caps() {
        let p = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter_pct: 0.0,
        };
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(10));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(20));
        assert_eq!(p.delay_for_attempt(4), Duration::from_millis(40));
        assert_eq!(p.delay_for_attempt(5), Duration::from_millis(80));
        assert_eq!(p.delay_for_attempt(6), Duration::from_millis(100)); // capped
    }

    #[test]
    fn jitter_bounds_hold_b3() {
        let p = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            jitter_pct: 0.25,
        };
        let base = p.base_delay_for_attempt(3); // 2000ms
        for sample in [-1.0, -0.5, 0.0, 0.5, 1.0] {
            let d = p.jittered(base, &FixedJitter(sample));
            let lo = (base.as_millis() as f64 * 0.75) as u128;
            let hi = (base.as_millis() as f64 * 1.25) as u128;
            assert!(d.as_millis() >= lo && d.as_millis() <= hi);
        }
    }

    #[test]
    fn permanent_failures_never_retry() {
        let p = RetryPolicy::default_policy();
        let f = Failure::permanent("bad card");
        assert_eq!(
            p.decide(&f, 1),
            RetryDecision::GiveUp {
                reason: f.to_string()
            }
        );
    }

    #[test]
    fn transient_failures_retry_until_exhausted() {
        let p = RetryPolicy {
            max_attempts: 2,
            base: Duration::from_millis(10),
            max: Duration::from_millis(100),
            jitter_pct: 0.0,
        };
        let f = Failure::transient("timeout");
        assert!(matches!(p.decide(&f, 1), RetryDecision::RetryAfter(_)));
        assert!(matches!(p.decide(&f, 2), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn book_resolves_named_policies() {
        let book = RetryPolicyBook::new();
        assert_eq!(book.get("payment").max_attempts, 3);
        assert_eq!(book.get("unknown_name").max_attempts, 5);
    }
}

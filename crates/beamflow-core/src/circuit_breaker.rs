//! Circuit Breaker: per-dependency closed/open/half-open state
//! machine protecting external calls from sustained overload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{circuit_breaker_topic, message_type, EventBus};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    pub fn with_recovery_timeout(mut self, d: Duration) -> Self {
        self.recovery_timeout = d;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
    use serde::Deserialize;
}

/// Snapshot returned by `status(name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError {
    #[error("circuit breaker '{0}' is open")]
    Open(String),
}

struct BreakerState {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
        }
    }

    fn snapshot(&self, name: &str) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            name: name.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            opened_at: self.opened_at,
        }
    }
}

/// Registry of named circuit breakers. One instance per process, shared
/// by the Actor and any operator tooling (CLI `circuit-breaker status/reset`).
///
/// Concurrency: a breaker is a shared mutable resource guarded by a
/// per-name mutex; `status` takes the same lock today rather
/// than a lock-free snapshot, since contention on a single breaker's row
/// is inherently low (one workflow at a time touches a given dependency
/// in the common case) and a stale-read optimization is not worth the
/// complexity here.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, BreakerState>>,
    defaults: HashMap<String, CircuitBreakerConfig>,
    clock: Clock,
    bus: Option<Arc<EventBus>>,
}

impl CircuitBreakerRegistry {
    pub fn new(clock: Clock) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            defaults: HashMap::new(),
            clock,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn configure(&mut self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.defaults.insert(name.into(), config);
    }

    fn config_for(&self, name: &str) -> CircuitBreakerConfig {
        self.defaults.get(name).cloned().unwrap_or_default()
    }

    /// Dry query: would a call be allowed right now? Unlike `allow`, this
    /// never performs the open -> half-open transition, so repeated
    /// status checks don't themselves consume the single half-open probe.
    pub fn status(&self, name: &str) -> CircuitBreakerStatus {
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerState::new(self.config_for(name)));
        entry.snapshot(name)
    }

    /// Query-and-transition: determines whether a call is allowed, performing
    /// the open -> half-open transition if the recovery timeout has elapsed.
    pub fn allow(&self, name: &str) -> Result<(), CircuitBreakerError> {
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerState::new(self.config_for(name)));

        match entry.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let deadline = entry
                    .opened_at
                    .map(|t| t + chrono::Duration::from_std(entry.config.recovery_timeout).unwrap_or_default());
                if deadline.map(|d| self.clock.now() >= d).unwrap_or(false) {
                    entry.state = CircuitState::HalfOpen;
                    entry.success_count = 0;
                    self.publish(name, entry);
                    Ok(())
                } else {
                    Err(CircuitBreakerError::Open(name.to_string()))
                }
            }
        }
    }

    pub fn report_success(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerState::new(self.config_for(name)));

        match entry.state {
            CircuitState::Closed => {
                entry.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                entry.success_count += 1;
                if entry.success_count >= entry.config.success_threshold {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.success_count = 0;
                    entry.opened_at = None;
                    self.publish(name, entry);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn report_failure(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerState::new(self.config_for(name)));

        match entry.state {
            CircuitState::Closed => {
                entry.failure_count += 1;
                if entry.failure_count >= entry.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.opened_at = Some(self.clock.now());
                    self.publish(name, entry);
                }
            }
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.opened_at = Some(self.clock.now());
                entry.success_count = 0;
                self.publish(name, entry);
            }
            CircuitState::Open => {}
        }
    }

    /// Operator intervention: force back to closed.
    pub fn reset(&self, name: &str) {
        let mut breakers = self.breakers.lock();
        let entry = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerState::new(self.config_for(name)));
        entry.state = CircuitState::Closed;
        entry.failure_count = 0;
        entry.success_count = 0;
        entry.opened_at = None;
        self.publish(name, entry);
    }

    /// Call `f` under the breaker's protection, reporting success/failure
    /// and translating a refusal into `CircuitBreakerError::Open`.
    pub async fn call<F, Fut, T, E>(&self, name: &str, f: F) -> Result<Result<T, E>, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.allow(name)?;
        let result = f().await;
        match &result {
            Ok(_) => self.report_success(name),
            Err(_) => self.report_failure(name),
        }
        Ok(result)
    }

    fn publish(&self, name: &str, entry: &BreakerState) {
        if let Some(bus) = &self.bus {
            bus.publish(
                circuit_breaker_topic(name),
                message_type::CIRCUIT_BREAKER_STATE_CHANGE,
                serde_json::json!({
                    "name": name,
                    "state": entry.state,
                    "failure_count": entry.failure_count,
                    "success_count": entry.success_count,
                }),
            );
        }
    }
}

//! Configuration surface: the knobs an operator sets for
//! storage, retry, circuit breaker, DLQ, idempotency, and validation
//! behavior. Parsed from TOML by the CLI (`dotenvy` + `BEAMFLOW_`
//! environment overrides); the kernel itself never reads the filesystem
//! or environment directly -- it only consumes an already-built
//! [`EngineConfig`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::graph::ValidationMode;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Memory,
    Disk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Only consulted when `mode == Disk`.
    pub dir: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::Memory,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryConfig {
    pub default: Option<RetryPolicy>,
    #[serde(default)]
    pub named: HashMap<String, RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DlqConfig {
    #[serde(with = "duration_millis_opt", default)]
    pub interval: Option<Duration>,
    pub max_retries: Option<u32>,
}

mod duration_millis_opt {
    use std::time::Duration;

    pub fn serialize<S>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Option<Duration>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
    use serde::Deserialize;
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdempotencyConfig {
    #[serde(with = "duration_millis_opt", default)]
    pub stale_after: Option<Duration>,
}

/// The full set of knobs for one running kernel instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breakers: HashMap<String, CircuitBreakerConfig>,
    #[serde(default)]
    pub dlq: DlqConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default = "default_validation_mode_name")]
    pub validation_mode: String,
}

fn default_validation_mode_name() -> String {
    "normal".to_string()
}

impl EngineConfig {
    pub fn validation_mode(&self) -> ValidationMode {
        match self.validation_mode.as_str() {
            "strict" => ValidationMode::Strict,
            "paranoid" => ValidationMode::Paranoid,
            "pedantic" => ValidationMode::Pedantic,
            _ => ValidationMode::Normal,
        }
    }

    pub fn dlq_interval(&self) -> Duration {
        self.dlq.interval.unwrap_or(Duration::from_secs(60))
    }

    pub fn dlq_max_retries(&self) -> u32 {
        self.dlq.max_retries.unwrap_or(5)
    }

    pub fn idempotency_stale_after(&self) -> Duration {
        self.idempotency
            .stale_after
            .unwrap_or(crate::idempotency::DEFAULT_STALE_AFTER)
    }

    pub fn retry_policy_book(&self) -> crate::retry::RetryPolicyBook {
        let mut book = crate::retry::RetryPolicyBook::new();
        if let Some(default) = self.retry.default.clone() {
            book.register("default", default);
        }
        for (name, policy) in &self.retry.named {
            book.register(name.clone(), policy.clone());
        }
        book
    }
}

impl Default for StorageMode {
    fn default() -> Self {
        StorageMode::Memory
    }
}

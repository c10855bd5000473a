//! Dead-Letter Queue: durable record of terminal/operational
//! failures, retried on a schedule, with operator override operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{message_type, EventBus, TOPIC_ALERTS};
use crate::clock::Clock;
use crate::error::Failure;
use crate::model::{DlqEntry, DlqEntryType, DlqFilter, DlqStatus};
use crate::store::{Store, StoreError};

/// Exponential backoff tuned longer than the step-level Retry Policy
///.
#[derive(Debug, Clone)]
pub struct DlqBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for DlqBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(60),
            max: Duration::from_secs(16 * 60),
        }
    }
}

impl DlqBackoff {
    fn delay_for(&self, retry_count: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(retry_count.min(32));
        let millis = self.base.as_millis().saturating_mul(multiplier as u128).min(self.max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("dlq entry not found: {0}")]
    NotFound(String),
}

/// Sanitizes `context`/`original_params` values before they are persisted.
/// Swapped out via [`DeadLetterQueue::with_redactor`] for deployments with
/// their own notion of what's sensitive; [`default_redactor`] covers the
/// common key names on its own.
pub type Redactor = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "authorization",
    "card_number",
    "cvv",
    "ssn",
];

/// Masks object values whose key contains a known-sensitive fragment,
/// recursing into nested objects/arrays; everything else passes through.
pub fn default_redactor(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_KEY_FRAGMENTS.iter().any(|s| lower.contains(s)) {
                        (k.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (k.clone(), default_redactor(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(default_redactor).collect()),
        other => other.clone(),
    }
}

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    clock: Clock,
    bus: Option<Arc<EventBus>>,
    backoff: DlqBackoff,
    default_max_retries: u32,
    redactor: Redactor,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, clock: Clock) -> Self {
        Self {
            store,
            clock,
            bus: None,
            backoff: DlqBackoff::default(),
            default_max_retries: 5,
            redactor: Arc::new(default_redactor),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.default_max_retries = n;
        self
    }

    /// Overrides the default key-name-based redactor, e.g. with one driven
    /// by a deployment-specific schema of sensitive fields.
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Persists a new entry. `context` and `original_params` are passed
    /// through the configured [`Redactor`] first, so sensitive workflow
    /// state never lands in durable storage unmasked.
    pub async fn enqueue(
        &self,
        entry_type: DlqEntryType,
        workflow_id: &str,
        kind: &str,
        error: Failure,
        context: HashMap<String, Value>,
        original_params: Value,
    ) -> Result<DlqEntry, DlqError> {
        let now = self.clock.now();
        let critical = matches!(entry_type, DlqEntryType::CompensationFailed | DlqEntryType::CriticalFailure);
        let context = context.into_iter().map(|(k, v)| (k, (self.redactor)(&v))).collect();
        let original_params = (self.redactor)(&original_params);
        let entry = DlqEntry {
            id: format!("dlq-{}-{}", workflow_id, now.timestamp_nanos_opt().unwrap_or_default()),
            workflow_id: workflow_id.to_string(),
            kind: kind.to_string(),
            entry_type,
            error,
            context,
            original_params,
            retry_count: 0,
            max_retries: self.default_max_retries,
            next_retry_at: now + chrono::Duration::from_std(self.backoff.base).unwrap_or_default(),
            status: DlqStatus::Pending,
            resolution: None,
            notes: None,
            critical,
            created_at: now,
            updated_at: now,
        };
        self.store.put_dlq(entry.clone()).await?;
        self.publish_alert(&entry);
        Ok(entry)
    }

    fn publish_alert(&self, entry: &DlqEntry) {
        if let Some(bus) = &self.bus {
            let severity = if entry.critical { "critical" } else { "warning" };
            bus.publish(
                TOPIC_ALERTS,
                message_type::ALERT,
                serde_json::json!({
                    "dlq_id": entry.id,
                    "workflow_id": entry.workflow_id,
                    "entry_type": entry.entry_type,
                    "severity": severity,
                }),
            );
        }
    }

    /// The derived-id naming scheme picks for DLQ retries:
    /// `"{id}_retry_{n}"`, preserving the original workflow's history.
    pub fn derived_retry_id(original_id: &str, attempt: u32) -> String {
        format!("{original_id}_retry_{attempt}")
    }

    /// Periodic sweep: scan due entries and
    /// return the ids that should be restarted under a derived id versus
    /// the ids that exhausted retries. The caller (Supervisor) performs
    /// the actual `StartWorkflow` call -- the queue itself never invokes
    /// the registry.
    pub async fn sweep(&self, limit: usize) -> Result<SweepResult, DlqError> {
        let now = self.clock.now();
        let due = self.store.list_due_dlq(now, limit).await?;
        let mut to_restart = Vec::new();
        let mut exhausted = Vec::new();

        for entry in due {
            if entry.retry_count < entry.max_retries {
                let retry_count = entry.retry_count + 1;
                let next_retry_at = now + chrono::Duration::from_std(self.backoff.delay_for(retry_count)).unwrap_or_default();
                let id = entry.id.clone();
                self.store
                    .update_dlq(
                        &id,
                        Box::new(move |e| {
                            e.retry_count = retry_count;
                            e.next_retry_at = next_retry_at;
                            e.status = DlqStatus::Retrying;
                            e.updated_at = now;
                        }),
                    )
                    .await?;
                info!(dlq_id = %id, retry_count, "dlq entry scheduled for restart");
                to_restart.push((entry.clone(), Self::derived_retry_id(&entry.workflow_id, retry_count)));
            } else {
                let id = entry.id.clone();
                self.store
                    .update_dlq(
                        &id,
                        Box::new(move |e| {
                            e.status = DlqStatus::MaxRetriesExceeded;
                            e.updated_at = now;
                        }),
                    )
                    .await?;
                warn!(dlq_id = %id, "dlq entry exhausted retries");
                self.publish_alert(&entry);
                exhausted.push(entry.id.clone());
            }
        }
        Ok(SweepResult { to_restart, exhausted })
    }

    pub async fn retry_now(&self, id: &str) -> Result<DlqEntry, DlqError> {
        let now = self.clock.now();
        self.store
            .update_dlq(id, Box::new(move |e| e.next_retry_at = now))
            .await?;
        self.store.get_dlq(id).await?.ok_or_else(|| DlqError::NotFound(id.to_string()))
    }

    pub async fn resolve(&self, id: &str, resolution: &str, notes: Option<&str>) -> Result<(), DlqError> {
        let resolution = resolution.to_string();
        let notes = notes.map(|s| s.to_string());
        let now = self.clock.now();
        self.store
            .update_dlq(
                id,
                Box::new(move |e| {
                    e.status = DlqStatus::Resolved;
                    e.resolution = Some(resolution);
                    e.notes = notes;
                    e.updated_at = now;
                }),
            )
            .await
            .map_err(Into::into)
    }

    pub async fn abandon(&self, id: &str, notes: Option<&str>) -> Result<(), DlqError> {
        let notes = notes.map(|s| s.to_string());
        let now = self.clock.now();
        self.store
            .update_dlq(
                id,
                Box::new(move |e| {
                    e.status = DlqStatus::Abandoned;
                    e.notes = notes;
                    e.updated_at = now;
                }),
            )
            .await
            .map_err(Into::into)
    }

    pub async fn list(&self, filter: DlqFilter, limit: usize) -> Result<Vec<DlqEntry>, DlqError> {
        Ok(self.store.list_dlq(filter, limit).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<DlqEntry>, DlqError> {
        Ok(self.store.get_dlq(id).await?)
    }
}

pub struct SweepResult {
    pub to_restart: Vec<(DlqEntry, String)>,
    pub exhausted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn dlq() -> DeadLetterQueue {
        DeadLetterQueue::new(Arc::new(MemoryStore::new()), Clock::manual(Utc::now()))
    }

    #[tokio::test]
    async fn enqueue_sets_pending_and_next_retry() {
        let q = dlq();
        let entry = q
            .enqueue(
                DlqEntryType::WorkflowFailed,
                "wf1",
                "T1",
                Failure::permanent("boom"),
                HashMap::new(),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(entry.status, DlqStatus::Pending);
        assert_eq!(entry.retry_count, 0);
    }

    #[tokio::test]
    async fn sweep_restarts_entries_under_budget() {
        let clock = Clock::manual(Utc::now());
        let q = DeadLetterQueue::new(Arc::new(MemoryStore::new()), clock.clone()).with_max_retries(3);
        q.enqueue(
            DlqEntryType::WorkflowFailed,
            "wf1",
            "T1",
            Failure::permanent("boom"),
            HashMap::new(),
            Value::Null,
        )
        .await
        .unwrap();
        clock.advance(chrono::Duration::minutes(2));
        let result = q.sweep(10).await.unwrap();
        assert_eq!(result.to_restart.len(), 1);
        assert_eq!(result.to_restart[0].1, "wf1_retry_1");
    }

    #[tokio::test]
    async fn sweep_exhausts_after_max_retries() {
        let clock = Clock::manual(Utc::now());
        let q = DeadLetterQueue::new(Arc::new(MemoryStore::new()), clock.clone()).with_max_retries(0);
        q.enqueue(
            DlqEntryType::WorkflowFailed,
            "wf1",
            "T1",
            Failure::permanent("boom"),
            HashMap::new(),
            Value::Null,
        )
        .await
        .unwrap();
        clock.advance(chrono::Duration::minutes(2));
        let result = q.sweep(10).await.unwrap();
        assert_eq!(result.exhausted.len(), 1);
    }

    #[tokio::test]
    async fn enqueue_redacts_sensitive_fields_by_default() {
        let q = dlq();
        let mut context = HashMap::new();
        context.insert("api_token".to_string(), serde_json::json!("sk-live-abc123"));
        let entry = q
            .enqueue(
                DlqEntryType::WorkflowFailed,
                "wf1",
                "T1",
                Failure::permanent("boom"),
                context,
                serde_json::json!({ "password": "hunter2", "account_id": "acct_1" }),
            )
            .await
            .unwrap();
        assert_eq!(entry.context["api_token"], serde_json::json!("[REDACTED]"));
        assert_eq!(entry.original_params["password"], serde_json::json!("[REDACTED]"));
        assert_eq!(entry.original_params["account_id"], serde_json::json!("acct_1"));
    }

    #[tokio::test]
    async fn resolve_and_abandon_set_terminal_status() {
        let q = dlq();
        let entry = q
            .enqueue(
                DlqEntryType::CriticalFailure,
                "wf1",
                "T1",
                Failure::permanent("boom"),
                HashMap::new(),
                Value::Null,
            )
            .await
            .unwrap();
        q.resolve(&entry.id, "manual_fix", Some("patched upstream")).await.unwrap();
        let got = q.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(got.status, DlqStatus::Resolved);
    }
}

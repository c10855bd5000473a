//! Idempotency Ledger: guarantees exactly-once external effects
//! across Actor restarts by serializing a step invocation's intent through
//! durable state before and after the actual call.
//!
//! The Ledger never calls user code; it only owns state transitions. It is
//! backed by the [`crate::store::Store`] so its entries survive a crash
//! alongside the workflow record they belong to.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Clock;
use crate::error::Failure;
use crate::store::{Store, StoreError};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdemStatus {
    Pending,
    Completed,
    Failed,
    Stale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    pub status: IdemStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<Failure>,
}

impl IdempotencyEntry {
    fn new_pending(key: String, now: DateTime<Utc>) -> Self {
        Self {
            key,
            status: IdemStatus::Pending,
            started_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.status == IdemStatus::Pending
            && now.signed_duration_since(self.started_at)
                > chrono::Duration::from_std(stale_after).unwrap_or_default()
    }
}

/// Key format: `"{workflow_id}:{node_id}:{attempt}"`.
/// `attempt` increases only after a terminal classification requires a new
/// external invocation (the resolution of the hash-vs-attempt open
/// question -- see DESIGN.md).
pub fn idem_key(workflow_id: &str, node_id: &str, attempt: u32) -> String {
    format!("{workflow_id}:{node_id}:{attempt}")
}

/// Outcome of asking the Ledger to begin an invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginOutcome {
    /// Caller proceeds to invoke under `key`.
    Ok { key: String },
    /// A live pending entry exists; caller may re-invoke (external service
    /// deduplicates) or wait/abort per local policy.
    AlreadyPending { key: String },
    /// A cached result exists; caller must not re-invoke.
    AlreadyCompleted { result: Value },
    /// A non-retriable failure was already recorded under this key.
    PreviouslyFailed { error: Failure },
}

pub struct IdempotencyLedger {
    store: Arc<dyn Store>,
    clock: Clock,
    stale_after: Duration,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn Store>, clock: Clock) -> Self {
        Self {
            store,
            clock,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, d: Duration) -> Self {
        self.stale_after = d;
        self
    }

    /// Step 1 of the begin/complete/fail protocol.
    pub async fn begin(&self, key: &str) -> Result<BeginOutcome, StoreError> {
        let now = self.clock.now();
        match self.store.get_idem(key).await? {
            None => {
                let entry = IdempotencyEntry::new_pending(key.to_string(), now);
                self.store.put_idem(entry).await?;
                Ok(BeginOutcome::Ok { key: key.to_string() })
            }
            Some(entry) if entry.status == IdemStatus::Completed => Ok(BeginOutcome::AlreadyCompleted {
                result: entry.result.unwrap_or(Value::Null),
            }),
            Some(entry) if entry.status == IdemStatus::Failed => Ok(BeginOutcome::PreviouslyFailed {
                error: entry.error.unwrap_or_else(|| Failure::permanent("unknown prior failure")),
            }),
            Some(entry) if entry.is_stale(now, self.stale_after) => {
                let mut stale = entry;
                stale.status = IdemStatus::Stale;
                self.store.put_idem(stale).await?;
                let fresh = IdempotencyEntry::new_pending(key.to_string(), now);
                self.store.put_idem(fresh).await?;
                Ok(BeginOutcome::Ok { key: key.to_string() })
            }
            Some(entry) => {
                debug_assert_eq!(entry.status, IdemStatus::Pending);
                Ok(BeginOutcome::AlreadyPending { key: key.to_string() })
            }
        }
    }

    /// Step 2: record the outcome of the actual invocation. Called by the
    /// Actor in the same transaction that appends the corresponding event.
    pub async fn complete(&self, key: &str, result: Value) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store
            .update_idem(key, Box::new(move |entry| {
                entry.status = IdemStatus::Completed;
                entry.completed_at = Some(now);
                entry.result = Some(result);
            }))
            .await
    }

    pub async fn fail(&self, key: &str, error: Failure) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.store
            .update_idem(key, Box::new(move |entry| {
                entry.status = IdemStatus::Failed;
                entry.completed_at = Some(now);
                entry.error = Some(error);
            }))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError> {
        self.store.get_idem(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn ledger() -> IdempotencyLedger {
        IdempotencyLedger::new(Arc::new(MemoryStore::new()), Clock::system())
    }

    #[tokio::test]
    async fn first_begin_creates_pending() {
        let l = ledger();
        let out = l.begin("wf:node:1").await.unwrap();
        assert_eq!(out, BeginOutcome::Ok { key: "wf:node:1".into() });
    }

    #[tokio::test]
    async fn second_begin_before_completion_is_already_pending() {
        let l = ledger();
        l.begin("wf:node:1").await.unwrap();
        let out = l.begin("wf:node:1").await.unwrap();
        assert_eq!(out, BeginOutcome::AlreadyPending { key: "wf:node:1".into() });
    }

    #[tokio::test]
    async fn completed_entry_is_immutable_and_cached_p4() {
        let l = ledger();
        l.begin("wf:node:1").await.unwrap();
        l.complete("wf:node:1", serde_json::json!({"ok": true})).await.unwrap();
        let out = l.begin("wf:node:1").await.unwrap();
        assert_eq!(
            out,
            BeginOutcome::AlreadyCompleted {
                result: serde_json::json!({"ok": true})
            }
        );
        // calling complete again must not be reachable through begin; the
        // entry itself never transitions once completed.
        let entry = l.get("wf:node:1").await.unwrap().unwrap();
        assert_eq!(entry.status, IdemStatus::Completed);
    }

    #[tokio::test]
    async fn stale_pending_is_retried_under_same_key() {
        let clock = Clock::manual(Utc::now());
        let l = IdempotencyLedger::new(Arc::new(MemoryStore::new()), clock.clone())
            .with_stale_after(Duration::from_secs(1));
        l.begin("wf:node:1").await.unwrap();
        clock.advance(chrono::Duration::seconds(2));
        let out = l.begin("wf:node:1").await.unwrap();
        assert_eq!(out, BeginOutcome::Ok { key: "wf:node:1".into() });
    }

    #[tokio::test]
    async fn failed_entry_reports_previously_failed() {
        let l = ledger();
        l.begin("wf:node:1").await.unwrap();
        l.fail("wf:node:1", Failure::permanent("bad")).await.unwrap();
        let out = l.begin("wf:node:1").await.unwrap();
        assert!(matches!(out, BeginOutcome::PreviouslyFailed { .. }));
    }
}

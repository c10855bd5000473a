//! In-memory Store backend. Production-grade peer of
//! [`super::sqlite::SqliteStore`], not a mock -- `storage.mode = memory` is
//! a supported deployment configuration for tests.
//!
//! `parking_lot::RwLock<HashMap<...>>` per table, with an
//! optimistic-concurrency check on event append.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::idempotency::IdempotencyEntry;
use crate::model::{DlqEntry, DlqFilter, EventRecord, WorkflowFilter, WorkflowRecord};

use super::{DlqMutator, IdemMutator, Store, StoreError};

struct WorkflowSlot {
    record: WorkflowRecord,
    events: Vec<EventRecord>,
}

pub struct MemoryStore {
    workflows: RwLock<HashMap<String, WorkflowSlot>>,
    idem: RwLock<HashMap<String, IdempotencyEntry>>,
    dlq: RwLock<HashMap<String, DlqEntry>>,
    dlq_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            idem: RwLock::new(HashMap::new()),
            dlq: RwLock::new(HashMap::new()),
            dlq_seq: AtomicU64::new(0),
        }
    }

    /// Number of workflow rows, exposed for test assertions.
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }

    pub fn next_dlq_id(&self) -> String {
        let n = self.dlq_seq.fetch_add(1, Ordering::SeqCst);
        format!("dlq-{n}")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let slot = workflows
            .entry(record.id.clone())
            .or_insert_with(|| WorkflowSlot {
                record: record.clone(),
                events: Vec::new(),
            });
        slot.record = record;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        Ok(self.workflows.read().get(id).map(|s| s.record.clone()))
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let workflows = self.workflows.read();
        let mut out: Vec<WorkflowRecord> = workflows
            .values()
            .map(|s| &s.record)
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| filter.kind.as_deref().map(|k| k == r.kind).unwrap_or(true))
            .filter(|r| filter.date_from.map(|d| r.started_at >= d).unwrap_or(true))
            .filter(|r| filter.date_to.map(|d| r.started_at <= d).unwrap_or(true))
            .filter(|r| {
                filter
                    .search
                    .as_deref()
                    .map(|q| r.id.contains(q) || r.kind.contains(q))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        out.sort_by_key(|r| r.started_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn count_by_status(&self) -> Result<HashMap<String, u64>, StoreError> {
        let mut counts = HashMap::new();
        for slot in self.workflows.read().values() {
            *counts.entry(slot.record.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn record_transition(
        &self,
        record: WorkflowRecord,
        event: EventRecord,
        expected_seq: u64,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let slot = workflows
            .entry(record.id.clone())
            .or_insert_with(|| WorkflowSlot {
                record: record.clone(),
                events: Vec::new(),
            });
        let actual_seq = slot.events.len() as u64;
        if actual_seq != expected_seq {
            return Err(StoreError::ConcurrencyConflict {
                id: record.id.clone(),
                expected: expected_seq,
                actual: actual_seq,
            });
        }
        slot.events.push(event);
        slot.record = record;
        Ok(())
    }

    async fn get_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(workflow_id)
            .map(|s| s.events.clone())
            .unwrap_or_default())
    }

    async fn put_idem(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        self.idem.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn get_idem(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError> {
        Ok(self.idem.read().get(key).cloned())
    }

    async fn update_idem(&self, key: &str, mutate: IdemMutator) -> Result<(), StoreError> {
        let mut idem = self.idem.write();
        match idem.get_mut(key) {
            Some(entry) => {
                mutate(entry);
                Ok(())
            }
            None => Err(StoreError::Serialization(format!(
                "no idempotency entry for key {key}"
            ))),
        }
    }

    async fn put_dlq(&self, entry: DlqEntry) -> Result<(), StoreError> {
        self.dlq.write().insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get_dlq(&self, id: &str) -> Result<Option<DlqEntry>, StoreError> {
        Ok(self.dlq.read().get(id).cloned())
    }

    async fn list_dlq(&self, filter: DlqFilter, limit: usize) -> Result<Vec<DlqEntry>, StoreError> {
        let dlq = self.dlq.read();
        let mut out: Vec<DlqEntry> = dlq
            .values()
            .filter(|e| {
                filter
                    .workflow_id
                    .as_deref()
                    .map(|w| w == e.workflow_id)
                    .unwrap_or(true)
            })
            .filter(|e| filter.kind.as_deref().map(|k| k == e.kind).unwrap_or(true))
            .filter(|e| filter.status.map(|s| s == e.status).unwrap_or(true))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_dlq(&self, id: &str, mutate: DlqMutator) -> Result<(), StoreError> {
        let mut dlq = self.dlq.write();
        match dlq.get_mut(id) {
            Some(entry) => {
                mutate(entry);
                Ok(())
            }
            None => Err(StoreError::DlqEntryNotFound(id.to_string())),
        }
    }

    async fn list_due_dlq(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DlqEntry>, StoreError> {
        let dlq = self.dlq.read();
        let mut out: Vec<DlqEntry> = dlq
            .values()
            .filter(|e| e.status == crate::model::DlqStatus::Pending && e.next_retry_at <= now)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.next_retry_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, WorkflowStatus};

    fn record(id: &str) -> WorkflowRecord {
        WorkflowRecord::new(id, "T1", Utc::now(), 3)
    }

    #[tokio::test]
    async fn put_and_get_workflow_roundtrips() {
        let store = MemoryStore::new();
        store.put_workflow(record("wf1")).await.unwrap();
        let got = store.get_workflow("wf1").await.unwrap().unwrap();
        assert_eq!(got.id, "wf1");
    }

    #[tokio::test]
    async fn record_transition_appends_event_and_updates_record() {
        let store = MemoryStore::new();
        let mut r = record("wf1");
        r.status = WorkflowStatus::Running;
        let event = EventRecord::new("wf1", 0, EventType::WorkflowStarted, Utc::now(), HashMap::new());
        store.record_transition(r, event, 0).await.unwrap();
        let events = store.get_events("wf1").await.unwrap();
        assert_eq!(events.len(), 1);
        let got = store.get_workflow("wf1").await.unwrap().unwrap();
        assert_eq!(got.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn record_transition_rejects_sequence_mismatch() {
        let store = MemoryStore::new();
        let r = record("wf1");
        let event = EventRecord::new("wf1", 0, EventType::WorkflowStarted, Utc::now(), HashMap::new());
        store.record_transition(r.clone(), event, 0).await.unwrap();

        let event2 = EventRecord::new("wf1", 1, EventType::StepStarted, Utc::now(), HashMap::new());
        let err = store.record_transition(r, event2, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }

    #[tokio::test]
    async fn list_due_dlq_filters_by_status_and_time() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let due = DlqEntry {
            id: "d1".into(),
            workflow_id: "wf1".into(),
            kind: "T1".into(),
            entry_type: crate::model::DlqEntryType::WorkflowFailed,
            error: crate::error::Failure::permanent("boom"),
            context: HashMap::new(),
            original_params: serde_json::Value::Null,
            retry_count: 0,
            max_retries: 3,
            next_retry_at: now - chrono::Duration::seconds(1),
            status: crate::model::DlqStatus::Pending,
            resolution: None,
            notes: None,
            critical: false,
            created_at: now,
            updated_at: now,
        };
        store.put_dlq(due).await.unwrap();
        let results = store.list_due_dlq(now, 10).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}

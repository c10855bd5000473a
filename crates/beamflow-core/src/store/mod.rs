//! Store: transactional durable tables for workflows, events,
//! idempotency entries, and DLQ entries.
//!
//! A single `async_trait` implemented once per backend (`memory`, `sqlite`)
//! with a narrow set of query helpers rather than a generic query builder.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{DlqEntry, DlqFilter, EventRecord, WorkflowFilter, WorkflowRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("concurrency conflict on {id}: expected seq {expected}, found {actual}")]
    ConcurrencyConflict {
        id: String,
        expected: u64,
        actual: u64,
    },
    #[error("dlq entry not found: {0}")]
    DlqEntryNotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn to_failure(&self) -> crate::error::Failure {
        crate::error::Failure::new(crate::error::FailureKind::StorageUnavailable, self.to_string())
    }
}

pub type IdemMutator = Box<dyn FnOnce(&mut crate::idempotency::IdempotencyEntry) + Send>;
pub type DlqMutator = Box<dyn FnOnce(&mut DlqEntry) + Send>;

/// The Store's API. Every method that mutates state is expected to be
/// atomic; `record_transition` is the one entry point the Actor uses to
/// pair a workflow-record write with an event append in one transaction.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError>;
    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError>;
    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError>;
    async fn count_by_status(&self) -> Result<std::collections::HashMap<String, u64>, StoreError>;

    /// Append a record to the workflow's event history and persist the
    /// corresponding workflow record mutation atomically. `expected_seq`
    /// is the number of events already known to the caller; a mismatch
    /// surfaces `ConcurrencyConflict` rather than silently reordering.
    async fn record_transition(
        &self,
        record: WorkflowRecord,
        event: EventRecord,
        expected_seq: u64,
    ) -> Result<(), StoreError>;

    async fn get_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError>;

    async fn put_idem(&self, entry: crate::idempotency::IdempotencyEntry) -> Result<(), StoreError>;
    async fn get_idem(&self, key: &str) -> Result<Option<crate::idempotency::IdempotencyEntry>, StoreError>;
    async fn update_idem(&self, key: &str, mutate: IdemMutator) -> Result<(), StoreError>;

    async fn put_dlq(&self, entry: DlqEntry) -> Result<(), StoreError>;
    async fn get_dlq(&self, id: &str) -> Result<Option<DlqEntry>, StoreError>;
    async fn list_dlq(&self, filter: DlqFilter, limit: usize) -> Result<Vec<DlqEntry>, StoreError>;
    async fn update_dlq(&self, id: &str, mutate: DlqMutator) -> Result<(), StoreError>;
    async fn list_due_dlq(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DlqEntry>, StoreError>;
}

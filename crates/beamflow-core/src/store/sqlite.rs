//! Disk-backed Store using SQLite.
//!
//! Uses SQLite via `sqlx` rather than a standalone database server -- a
//! single-node embeddable engine has no need for one, and SQLite keeps the
//! "create tables idempotently on startup" requirement trivial to satisfy
//! with a bundled file (see DESIGN.md for the rationale).
//!
//! Every query here is a runtime `sqlx::query`/`query_as` call, never the
//! `query!`/`query_as!` compile-time-checked macros -- those require a
//! live database connection (or an offline query cache) at build time,
//! which this workspace does not provision.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::idempotency::IdempotencyEntry;
use crate::model::{DlqEntry, DlqFilter, EventRecord, WorkflowFilter, WorkflowRecord};

use super::{DlqMutator, IdemMutator, Store, StoreError};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if absent) a SQLite database at `path` and run the
    /// idempotent schema migration.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[instrument(skip(self))]
    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                record TEXT NOT NULL,
                event_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                workflow_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (workflow_id, sequence_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS idempotency (
                key TEXT PRIMARY KEY,
                entry TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                next_retry_at TEXT NOT NULL,
                entry TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    #[instrument(skip(self, record))]
    async fn put_workflow(&self, record: WorkflowRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflows (id, kind, record) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, record = excluded.record",
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let json: String = row.get("record");
                let record = serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
        }
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
        limit: usize,
    ) -> Result<Vec<WorkflowRecord>, StoreError> {
        let rows = sqlx::query("SELECT record FROM workflows")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let json: String = row.get("record");
            let record: WorkflowRecord =
                serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
            if filter.status.map(|s| s == record.status).unwrap_or(true)
                && filter.kind.as_deref().map(|k| k == record.kind).unwrap_or(true)
                && filter.date_from.map(|d| record.started_at >= d).unwrap_or(true)
                && filter.date_to.map(|d| record.started_at <= d).unwrap_or(true)
                && filter
                    .search
                    .as_deref()
                    .map(|q| record.id.contains(q) || record.kind.contains(q))
                    .unwrap_or(true)
            {
                out.push(record);
            }
        }
        out.sort_by_key(|r| r.started_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn count_by_status(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT record FROM workflows")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut counts = HashMap::new();
        for row in rows {
            let json: String = row.get("record");
            let record: WorkflowRecord =
                serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
            *counts.entry(record.status.to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    #[instrument(skip(self, record, event))]
    async fn record_transition(
        &self,
        record: WorkflowRecord,
        event: EventRecord,
        expected_seq: u64,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let actual: i64 = sqlx::query("SELECT COUNT(*) as c FROM events WHERE workflow_id = ?")
            .bind(&record.id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .get("c");

        if actual as u64 != expected_seq {
            return Err(StoreError::ConcurrencyConflict {
                id: record.id.clone(),
                expected: expected_seq,
                actual: actual as u64,
            });
        }

        let event_json = serde_json::to_string(&event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query("INSERT INTO events (workflow_id, sequence_number, event) VALUES (?, ?, ?)")
            .bind(&event.workflow_id)
            .bind(event.sequence_number as i64)
            .bind(&event_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let record_json = serde_json::to_string(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflows (id, kind, record) VALUES (?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET kind = excluded.kind, record = excluded.record",
        )
        .bind(&record.id)
        .bind(&record.kind)
        .bind(&record_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_events(&self, workflow_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT event FROM events WHERE workflow_id = ? ORDER BY sequence_number ASC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("event");
            out.push(serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?);
        }
        Ok(out)
    }

    async fn put_idem(&self, entry: IdempotencyEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO idempotency (key, entry) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET entry = excluded.entry",
        )
        .bind(&entry.key)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_idem(&self, key: &str) -> Result<Option<IdempotencyEntry>, StoreError> {
        let row = sqlx::query("SELECT entry FROM idempotency WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let json: String = row.get("entry");
                Ok(Some(
                    serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?,
                ))
            }
        }
    }

    async fn update_idem(&self, key: &str, mutate: IdemMutator) -> Result<(), StoreError> {
        let mut entry = self
            .get_idem(key)
            .await?
            .ok_or_else(|| StoreError::Serialization(format!("no idempotency entry for key {key}")))?;
        mutate(&mut entry);
        self.put_idem(entry).await
    }

    async fn put_dlq(&self, entry: DlqEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO dlq (id, workflow_id, kind, status, next_retry_at, entry) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, next_retry_at = excluded.next_retry_at, entry = excluded.entry",
        )
        .bind(&entry.id)
        .bind(&entry.workflow_id)
        .bind(&entry.kind)
        .bind(serde_json::to_string(&entry.status).unwrap_or_default())
        .bind(entry.next_retry_at.to_rfc3339())
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_dlq(&self, id: &str) -> Result<Option<DlqEntry>, StoreError> {
        let row = sqlx::query("SELECT entry FROM dlq WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        match row {
            None => Ok(None),
            Some(row) => {
                let json: String = row.get("entry");
                Ok(Some(
                    serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?,
                ))
            }
        }
    }

    async fn list_dlq(&self, filter: DlqFilter, limit: usize) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query("SELECT entry FROM dlq")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let json: String = row.get("entry");
            let entry: DlqEntry = serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
            if filter
                .workflow_id
                .as_deref()
                .map(|w| w == entry.workflow_id)
                .unwrap_or(true)
                && filter.kind.as_deref().map(|k| k == entry.kind).unwrap_or(true)
                && filter.status.map(|s| s == entry.status).unwrap_or(true)
            {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_dlq(&self, id: &str, mutate: DlqMutator) -> Result<(), StoreError> {
        let mut entry = self
            .get_dlq(id)
            .await?
            .ok_or_else(|| StoreError::DlqEntryNotFound(id.to_string()))?;
        mutate(&mut entry);
        self.put_dlq(entry).await
    }

    async fn list_due_dlq(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DlqEntry>, StoreError> {
        let rows = sqlx::query("SELECT entry FROM dlq WHERE status = ?")
            .bind(serde_json::to_string(&crate::model::DlqStatus::Pending).unwrap_or_default())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let json: String = row.get("entry");
            let entry: DlqEntry = serde_json::from_str(&json).map_err(|e| StoreError::Serialization(e.to_string()))?;
            if entry.next_retry_at <= now {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.next_retry_at);
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, WorkflowStatus};
    use std::collections::HashMap as Map;

    #[tokio::test]
    async fn put_and_get_workflow_roundtrips() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = WorkflowRecord::new("wf1", "T1", Utc::now(), 3);
        store.put_workflow(record).await.unwrap();
        let got = store.get_workflow("wf1").await.unwrap().unwrap();
        assert_eq!(got.id, "wf1");
        assert_eq!(got.status, WorkflowStatus::Pending);
    }

    #[tokio::test]
    async fn record_transition_is_atomic_with_event_append() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut record = WorkflowRecord::new("wf1", "T1", Utc::now(), 3);
        record.status = WorkflowStatus::Running;
        let event = EventRecord::new("wf1", 0, EventType::WorkflowStarted, Utc::now(), Map::new());
        store.record_transition(record, event, 0).await.unwrap();
        assert_eq!(store.get_events("wf1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrency_conflict_detected() {
        let store = SqliteStore::in_memory().await.unwrap();
        let record = WorkflowRecord::new("wf1", "T1", Utc::now(), 3);
        let event = EventRecord::new("wf1", 0, EventType::WorkflowStarted, Utc::now(), Map::new());
        store.record_transition(record.clone(), event, 0).await.unwrap();
        let event2 = EventRecord::new("wf1", 1, EventType::StepStarted, Utc::now(), Map::new());
        let err = store.record_transition(record, event2, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    }
}

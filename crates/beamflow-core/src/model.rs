//! Data model shared by the Store, Actor, Graph, and DLQ.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Abandoned,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Abandoned
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Compensating => "compensating",
            WorkflowStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

/// The durable aggregate per workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub kind: String,
    pub status: WorkflowStatus,
    pub current_node_id: Option<String>,
    pub executed_nodes: Vec<String>,
    pub executed_saga_nodes: Vec<String>,
    pub state: HashMap<String, Value>,
    pub total_steps: u32,
    pub current_step_index: u32,
    pub error: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRecord {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, now: DateTime<Utc>, total_steps: u32) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status: WorkflowStatus::Pending,
            current_node_id: None,
            executed_nodes: Vec::new(),
            executed_saga_nodes: Vec::new(),
            state: HashMap::new(),
            total_steps,
            current_step_index: 0,
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Checks the record's structural invariants. Used by tests rather
    /// than enforced on every mutation, since a few transient in-flight
    /// states (e.g. mid-compensation) are legitimately not yet consistent.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.status.is_terminal() {
            if self.completed_at.is_none() {
                return Err("terminal status without completed_at".into());
            }
            if self.current_node_id.is_some() {
                return Err("terminal status with current_node_id set".into());
            }
        } else if self.completed_at.is_some() {
            return Err("non-terminal status with completed_at set".into());
        }
        let executed: std::collections::HashSet<_> = self.executed_nodes.iter().collect();
        if !self.executed_saga_nodes.iter().all(|n| executed.contains(n)) {
            return Err("executed_saga_nodes not subset of executed_nodes".into());
        }
        if self.current_step_index > self.total_steps {
            return Err("current_step_index exceeds total_steps".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    BranchTaken,
    SagaStepCompensated,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowAbandoned,
    RetryScheduled,
}

/// Append-only history record, keyed by `(workflow_id, sequence_number)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub workflow_id: String,
    pub sequence_number: u64,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl EventRecord {
    pub fn new(
        workflow_id: impl Into<String>,
        sequence_number: u64,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        metadata: HashMap<String, Value>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            sequence_number,
            event_type,
            timestamp,
            metadata,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqEntryType {
    WorkflowFailed,
    CompensationFailed,
    CriticalFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
    MaxRetriesExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub workflow_id: String,
    pub kind: String,
    pub entry_type: DlqEntryType,
    pub error: Failure,
    pub context: HashMap<String, Value>,
    pub original_params: Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: DateTime<Utc>,
    pub status: DlqStatus,
    pub resolution: Option<String>,
    pub notes: Option<String>,
    pub critical: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filters accepted by `ListWorkflows`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub kind: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub workflow_id: Option<String>,
    pub kind: Option<String>,
    pub status: Option<DlqStatus>,
}

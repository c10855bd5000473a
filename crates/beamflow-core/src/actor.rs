//! Workflow Actor: the per-instance driver that walks the
//! graph node by node, consulting the Idempotency Ledger and Circuit
//! Breaker around every step invocation, persisting each transition
//! through [`crate::store::Store::record_transition`], and handing off to
//! the Saga Compensator on unrecoverable failure.
//!
//! One `Actor` drives exactly one workflow instance for the lifetime of a
//! single `run`/`resume` call. It holds no long-lived background task of
//! its own; the Supervisor owns scheduling and restart policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::{message_type, workflow_topic, EventBus};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::contract::{Step, WorkflowDefinition};
use crate::dlq::DeadLetterQueue;
use crate::error::{Failure, FailureKind};
use crate::graph::{Graph, NodeKind, State};
use crate::idempotency::{idem_key, BeginOutcome, IdempotencyLedger};
use crate::model::{DlqEntryType, EventRecord, EventType, WorkflowRecord, WorkflowStatus};
use crate::retry::{RetryDecision, RetryPolicyBook};
use crate::saga::{SagaCompensator, SagaOutcome};
use crate::store::{Store, StoreError};

/// Reserved state field a step's input is given under, so side-effectful
/// steps can forward it to an external system for server-side dedup.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotency_key";

#[derive(Debug, Error)]
pub enum ActorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("workflow already exists: {0}")]
    AlreadyExists(String),
    #[error("unknown step module: {0}")]
    UnknownStep(String),
}

/// Cooperative cancellation handle. The Actor observes the flag between
/// nodes and after a step's own invocation completes; there is no
/// mid-`execute` interrupt, so a caller that needs a hard deadline must
/// also bound `Step::execute` itself.
#[derive(Clone, Default)]
pub struct CancellationHandle(Arc<AtomicBool>);

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Shared kernel components an Actor borrows to drive a workflow. Built
/// once per process (or per test) and cloned cheaply via `Arc`s.
pub struct ActorDeps {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<IdempotencyLedger>,
    pub breaker: Arc<CircuitBreakerRegistry>,
    pub retry_policies: RetryPolicyBook,
    pub saga: Arc<SagaCompensator>,
    pub dlq: Arc<DeadLetterQueue>,
    pub bus: Option<Arc<EventBus>>,
    pub clock: Clock,
}

pub struct Actor {
    deps: Arc<ActorDeps>,
    definition: Arc<dyn WorkflowDefinition>,
    graph: Graph,
    cancellation: CancellationHandle,
}

impl Actor {
    pub fn new(deps: Arc<ActorDeps>, definition: Arc<dyn WorkflowDefinition>) -> Result<Self, crate::graph::GraphError> {
        let graph = definition.graph()?;
        Ok(Self {
            deps,
            definition,
            graph,
            cancellation: CancellationHandle::new(),
        })
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// `StartWorkflow`: create a fresh record at the graph's
    /// start node and drive it to completion (or the first suspension
    /// point -- there is none in this synchronous-drive model; `run`
    /// always returns a terminal record).
    pub async fn start(&self, workflow_id: &str, params: Value) -> Result<WorkflowRecord, ActorError> {
        if self.deps.store.get_workflow(workflow_id).await?.is_some() {
            return Err(ActorError::AlreadyExists(workflow_id.to_string()));
        }
        let state = self
            .definition
            .initial_state(params)
            .map_err(|e| ActorError::UnknownStep(e.to_string()))?;
        let now = self.deps.clock.now();
        let mut record = WorkflowRecord::new(workflow_id, self.definition.kind(), now, self.graph.step_nodes().count() as u32);
        record.state = state;
        record.status = WorkflowStatus::Running;
        record.current_node_id = Some(self.graph.start_node.clone());

        self.deps.store.put_workflow(record.clone()).await?;
        let event = EventRecord::new(workflow_id, 0, EventType::WorkflowStarted, now, HashMap::new());
        self.deps.store.record_transition(record.clone(), event, 0).await?;

        self.drive(record).await
    }

    /// Resume an existing, non-terminal record from its `current_node_id`
    /// (the cold-start recovery requirement). A terminal record is
    /// returned unchanged.
    pub async fn resume(&self, workflow_id: &str) -> Result<WorkflowRecord, ActorError> {
        let record = self
            .deps
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| ActorError::NotFound(workflow_id.to_string()))?;

        if record.status.is_terminal() {
            return Ok(record);
        }
        if record.status == WorkflowStatus::Compensating {
            return Ok(self.finish_compensation(record).await?);
        }
        self.drive(record).await
    }

    async fn next_seq(&self, workflow_id: &str) -> Result<u64, ActorError> {
        Ok(self.deps.store.get_events(workflow_id).await?.len() as u64)
    }

    /// The main node-by-node loop. Runs until the record reaches a
    /// terminal status.
    async fn drive(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord, ActorError> {
        loop {
            if record.status.is_terminal() {
                return Ok(record);
            }

            if self.cancellation.is_cancelled() {
                record = self.cancel_and_compensate(record).await?;
                return Ok(record);
            }

            let Some(current_id) = record.current_node_id.clone() else {
                return Err(ActorError::NotFound(record.id.clone()));
            };
            let Some(node) = self.graph.node(&current_id).cloned() else {
                return Err(ActorError::NotFound(current_id));
            };

            match node.kind {
                NodeKind::Start => {
                    let next = self.graph.next_nodes(&current_id, &record.state);
                    record.current_node_id = next;
                }
                NodeKind::End => {
                    record = self.complete_workflow(record).await?;
                }
                NodeKind::Join => {
                    let next = self.graph.next_nodes(&current_id, &record.state);
                    record.current_node_id = next;
                }
                NodeKind::Branch { .. } | NodeKind::Dispatch { .. } => {
                    record = self.take_branch(record, &current_id).await?;
                }
                NodeKind::Step { is_side_effectful } => {
                    record = self.run_step(record, &current_id, node.module.as_deref(), is_side_effectful).await?;
                }
            }
        }
    }

    async fn take_branch(&self, mut record: WorkflowRecord, node_id: &str) -> Result<WorkflowRecord, ActorError> {
        let next = self.graph.next_nodes(node_id, &record.state);
        let seq = self.next_seq(&record.id).await?;
        record.current_node_id = next.clone();
        record.updated_at = self.deps.clock.now();
        let mut metadata = HashMap::new();
        metadata.insert("node_id".to_string(), serde_json::json!(node_id));
        metadata.insert("next".to_string(), serde_json::json!(next));
        let event = EventRecord::new(&record.id, seq, EventType::BranchTaken, record.updated_at, metadata);
        self.deps.store.record_transition(record.clone(), event, seq).await?;
        Ok(record)
    }

    async fn run_step(
        &self,
        mut record: WorkflowRecord,
        node_id: &str,
        module: Option<&str>,
        is_side_effectful: bool,
    ) -> Result<WorkflowRecord, ActorError> {
        let module = module.ok_or_else(|| ActorError::UnknownStep(node_id.to_string()))?;
        let step = self
            .definition
            .step(module)
            .ok_or_else(|| ActorError::UnknownStep(module.to_string()))?;

        if let Err(failure) = step.validate(&record.state) {
            return self.fail_step(record, node_id, module, failure).await;
        }

        self.publish_step(&record.id, node_id, message_type::STEP_STARTED);

        match self.invoke_with_retry(&record, node_id, module, step.as_ref(), &record.state).await {
            Ok(new_state) => {
                let folded = self.definition.handle_step_success(module, new_state);
                record.state = folded;
                record.executed_nodes.push(node_id.to_string());
                if is_side_effectful {
                    record.executed_saga_nodes.push(node_id.to_string());
                }
                record.current_step_index += 1;
                let next = self.graph.next_nodes(node_id, &record.state);
                record.current_node_id = next;
                record.updated_at = self.deps.clock.now();

                let seq = self.next_seq(&record.id).await?;
                let mut metadata = HashMap::new();
                metadata.insert("node_id".to_string(), serde_json::json!(node_id));
                let event = EventRecord::new(&record.id, seq, EventType::StepCompleted, record.updated_at, metadata);
                self.deps.store.record_transition(record.clone(), event, seq).await?;
                self.publish_step(&record.id, node_id, message_type::STEP_COMPLETED);
                Ok(record)
            }
            Err(failure) => {
                self.publish_step(&record.id, node_id, message_type::STEP_FAILED);
                self.fail_step(record, node_id, module, failure).await
            }
        }
    }

    /// Drives the attempt loop for a single step node: each attempt gets
    /// its own idempotency key, so a transient failure's retry is a fresh
    /// invocation rather than contending with the previous attempt's
    /// ledger entry. The key is also injected into the step's input state
    /// under [`IDEMPOTENCY_KEY_FIELD`] so a side-effectful step can forward
    /// it to whatever it calls for server-side dedup.
    async fn invoke_with_retry(
        &self,
        record: &WorkflowRecord,
        node_id: &str,
        module: &str,
        step: &(dyn Step + '_),
        state: &State,
    ) -> Result<State, Failure> {
        let workflow_id = record.id.as_str();
        let policy = self.deps.retry_policies.get(module);
        let mut attempt = 1u32;

        loop {
            let key = idem_key(workflow_id, node_id, attempt);
            let begin = self
                .deps
                .ledger
                .begin(&key)
                .await
                .map_err(|e| Failure::new(FailureKind::StorageUnavailable, e.to_string()))?;

            match begin {
                BeginOutcome::AlreadyCompleted { result } => {
                    return Ok(value_to_state(result));
                }
                BeginOutcome::PreviouslyFailed { error } => {
                    return Err(error);
                }
                BeginOutcome::AlreadyPending { .. } => {
                    warn!(node = %node_id, attempt, "invocation already pending, treating as transient");
                    return Err(Failure::transient("invocation already in flight"));
                }
                BeginOutcome::Ok { .. } => {}
            }

            let mut input_state = state.clone();
            input_state.insert(IDEMPOTENCY_KEY_FIELD.to_string(), serde_json::json!(key));

            let timeout = step.timeout();
            let call_result = self
                .deps
                .breaker
                .call(module, || async {
                    match tokio::time::timeout(timeout, step.execute(&input_state)).await {
                        Ok(result) => result,
                        Err(_elapsed) => Err(Failure::transient("step timed out").with_code("timeout")),
                    }
                })
                .await;
            let outcome = match call_result {
                Ok(inner) => inner,
                Err(_open) => Err(Failure::transient("circuit open").with_code("circuit_open")),
            };

            match outcome {
                Ok(new_state) => {
                    self.deps
                        .ledger
                        .complete(&key, state_to_value(&new_state))
                        .await
                        .map_err(|e| Failure::new(FailureKind::StorageUnavailable, e.to_string()))?;
                    return Ok(new_state);
                }
                Err(failure) => {
                    self.deps
                        .ledger
                        .fail(&key, failure.clone())
                        .await
                        .map_err(|e| Failure::new(FailureKind::StorageUnavailable, e.to_string()))?;
                    match policy.decide(&failure, attempt) {
                        RetryDecision::RetryAfter(delay) => {
                            let seq = self
                                .deps
                                .store
                                .get_events(workflow_id)
                                .await
                                .map_err(|e| Failure::new(FailureKind::StorageUnavailable, e.to_string()))?
                                .len() as u64;
                            let mut metadata = HashMap::new();
                            metadata.insert("node_id".to_string(), serde_json::json!(node_id));
                            metadata.insert("attempt".to_string(), serde_json::json!(attempt));
                            metadata.insert("delay_ms".to_string(), serde_json::json!(delay.as_millis() as u64));
                            let now = self.deps.clock.now();
                            let event = EventRecord::new(workflow_id, seq, EventType::RetryScheduled, now, metadata);
                            let mut snapshot = record.clone();
                            snapshot.updated_at = now;
                            self.deps
                                .store
                                .record_transition(snapshot, event, seq)
                                .await
                                .map_err(|e| Failure::new(FailureKind::StorageUnavailable, e.to_string()))?;
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                            continue;
                        }
                        RetryDecision::GiveUp { .. } => return Err(failure),
                    }
                }
            }
        }
    }

    async fn fail_step(
        &self,
        mut record: WorkflowRecord,
        node_id: &str,
        module: &str,
        failure: Failure,
    ) -> Result<WorkflowRecord, ActorError> {
        record.state = self.definition.handle_step_failure(module, &failure, record.state.clone());
        record.error = Some(failure);
        record.status = WorkflowStatus::Compensating;
        record.current_node_id = None;
        record.updated_at = self.deps.clock.now();

        let seq = self.next_seq(&record.id).await?;
        let mut metadata = HashMap::new();
        metadata.insert("node_id".to_string(), serde_json::json!(node_id));
        let event = EventRecord::new(&record.id, seq, EventType::StepFailed, record.updated_at, metadata);
        self.deps.store.record_transition(record.clone(), event, seq).await?;

        self.finish_compensation(record).await
    }

    /// Runs the Saga Compensator over whatever `executed_saga_nodes` the
    /// record carries and settles the final terminal status.
    async fn finish_compensation(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord, ActorError> {
        let outcome = self
            .deps
            .saga
            .compensate(&record, &self.graph, &self.definition, &record.state.clone())
            .await;

        let now = self.deps.clock.now();
        record.updated_at = now;
        record.completed_at = Some(now);

        let (status, event_type) = match outcome {
            SagaOutcome::AllCompensated => (WorkflowStatus::Failed, EventType::WorkflowFailed),
            SagaOutcome::Abandoned { .. } => (WorkflowStatus::Abandoned, EventType::WorkflowAbandoned),
        };
        record.status = status;

        if status == WorkflowStatus::Failed {
            if let Some(failure) = record.error.clone() {
                let mut context = HashMap::new();
                context.insert("node_id".to_string(), serde_json::json!(record.current_node_id));
                if let Err(e) = self
                    .deps
                    .dlq
                    .enqueue(
                        DlqEntryType::WorkflowFailed,
                        &record.id,
                        &record.kind,
                        failure,
                        context,
                        state_to_value(&record.state),
                    )
                    .await
                {
                    warn!(workflow_id = %record.id, error = %e, "failed to enqueue workflow_failed dlq entry");
                }
            }
        }

        let seq = self.next_seq(&record.id).await?;
        let event = EventRecord::new(&record.id, seq, event_type, now, HashMap::new());
        self.deps.store.record_transition(record.clone(), event, seq).await?;

        let message_type = match record.status {
            WorkflowStatus::Failed => message_type::WORKFLOW_FAILED,
            WorkflowStatus::Abandoned => message_type::WORKFLOW_ABANDONED,
            _ => message_type::WORKFLOW_UPDATED,
        };
        self.publish_workflow(&record.id, message_type);
        Ok(record)
    }

    async fn complete_workflow(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord, ActorError> {
        let now = self.deps.clock.now();
        record.status = WorkflowStatus::Completed;
        record.current_node_id = None;
        record.updated_at = now;
        record.completed_at = Some(now);

        let seq = self.next_seq(&record.id).await?;
        let event = EventRecord::new(&record.id, seq, EventType::WorkflowCompleted, now, HashMap::new());
        self.deps.store.record_transition(record.clone(), event, seq).await?;
        self.publish_workflow(&record.id, message_type::WORKFLOW_COMPLETED);
        info!(workflow_id = %record.id, "workflow completed");
        Ok(record)
    }

    async fn cancel_and_compensate(&self, mut record: WorkflowRecord) -> Result<WorkflowRecord, ActorError> {
        record.error = Some(Failure::cancelled("workflow cancelled by operator"));
        record.status = WorkflowStatus::Compensating;
        record.current_node_id = None;
        record.updated_at = self.deps.clock.now();

        let seq = self.next_seq(&record.id).await?;
        let event = EventRecord::new(&record.id, seq, EventType::WorkflowAbandoned, record.updated_at, HashMap::new());
        self.deps.store.record_transition(record.clone(), event, seq).await?;

        // cancellation always settles as abandoned, regardless of whether
        // every compensation individually succeeded: the workflow was
        // deliberately stopped, not failed.
        let _ = self.deps.saga.compensate(&record, &self.graph, &self.definition, &record.state.clone()).await;
        let now = self.deps.clock.now();
        record.status = WorkflowStatus::Abandoned;
        record.completed_at = Some(now);
        record.updated_at = now;
        let seq = self.next_seq(&record.id).await?;
        let event = EventRecord::new(&record.id, seq, EventType::WorkflowAbandoned, now, HashMap::new());
        self.deps.store.record_transition(record.clone(), event, seq).await?;
        self.publish_workflow(&record.id, message_type::WORKFLOW_ABANDONED);
        Ok(record)
    }

    fn publish_step(&self, workflow_id: &str, node_id: &str, message_type: &str) {
        if let Some(bus) = &self.deps.bus {
            bus.publish(
                workflow_topic(workflow_id),
                message_type,
                serde_json::json!({ "workflow_id": workflow_id, "node_id": node_id }),
            );
        }
    }

    fn publish_workflow(&self, workflow_id: &str, message_type: &str) {
        if let Some(bus) = &self.deps.bus {
            bus.publish(
                workflow_topic(workflow_id),
                message_type,
                serde_json::json!({ "workflow_id": workflow_id }),
            );
        }
    }
}

fn state_to_value(state: &State) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

fn value_to_state(value: Value) -> State {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => State::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, GraphError, StepSpec};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    struct IncrementStep;

    #[async_trait]
    impl Step for IncrementStep {
        async fn execute(&self, state: &State) -> Result<State, Failure> {
            let mut next = state.clone();
            let n = next.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            next.insert("n".to_string(), serde_json::json!(n + 1));
            Ok(next)
        }
    }

    struct AlwaysFailStep;

    #[async_trait]
    impl Step for AlwaysFailStep {
        async fn execute(&self, _state: &State) -> Result<State, Failure> {
            Err(Failure::permanent("nope"))
        }
        fn is_side_effectful(&self) -> bool {
            true
        }
    }

    struct FlakyStep {
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl Step for FlakyStep {
        async fn execute(&self, state: &State) -> Result<State, Failure> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(Failure::transient("flaky").with_code("timeout"));
            }
            Ok(state.clone())
        }
    }

    struct LinearWorkflow {
        fail: bool,
    }

    impl WorkflowDefinition for LinearWorkflow {
        fn kind(&self) -> &str {
            "linear"
        }
        fn graph(&self) -> Result<Graph, GraphError> {
            GraphBuilder::new().linear(vec![StepSpec::new("inc", "inc")])
        }
        fn initial_state(&self, params: Value) -> Result<State, crate::contract::DefinitionError> {
            match params {
                Value::Object(m) => Ok(m.into_iter().collect()),
                _ => Ok(State::new()),
            }
        }
        fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
            match module {
                "inc" if !self.fail => Some(Arc::new(IncrementStep)),
                "inc" if self.fail => Some(Arc::new(AlwaysFailStep)),
                _ => None,
            }
        }
    }

    fn deps() -> Arc<ActorDeps> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Clock::manual(chrono::Utc::now());
        let ledger = Arc::new(IdempotencyLedger::new(store.clone(), clock.clone()));
        let breaker = Arc::new(CircuitBreakerRegistry::new(clock.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(store.clone(), clock.clone()));
        let saga = Arc::new(SagaCompensator::new(ledger.clone(), breaker.clone(), dlq.clone()));
        Arc::new(ActorDeps {
            store,
            ledger,
            breaker,
            retry_policies: RetryPolicyBook::new(),
            saga,
            dlq,
            bus: None,
            clock,
        })
    }

    #[tokio::test]
    async fn start_runs_linear_workflow_to_completion() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: false });
        let actor = Actor::new(d, def).unwrap();
        let record = actor.start("wf1", serde_json::json!({"n": 0})).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
        assert_eq!(record.state.get("n").and_then(|v| v.as_i64()), Some(1));
    }

    #[tokio::test]
    async fn permanent_step_failure_compensates_and_fails() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: true });
        let actor = Actor::new(d, def).unwrap();
        let record = actor.start("wf1", serde_json::json!({})).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Failed);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn resume_on_terminal_record_is_a_no_op() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: false });
        let actor = Actor::new(d.clone(), def).unwrap();
        actor.start("wf1", serde_json::json!({})).await.unwrap();
        let resumed = actor.resume("wf1").await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn cancellation_settles_as_abandoned() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: false });
        let actor = Actor::new(d, def).unwrap();
        actor.cancellation_handle().cancel();
        let record = actor.start("wf1", serde_json::json!({})).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Abandoned);
    }

    struct FlakyWorkflow;

    impl WorkflowDefinition for FlakyWorkflow {
        fn kind(&self) -> &str {
            "flaky"
        }
        fn graph(&self) -> Result<Graph, GraphError> {
            GraphBuilder::new().linear(vec![StepSpec::new("flaky", "flaky")])
        }
        fn initial_state(&self, _params: Value) -> Result<State, crate::contract::DefinitionError> {
            Ok(State::new())
        }
        fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
            match module {
                "flaky" => Some(Arc::new(FlakyStep { remaining_failures: AtomicU32::new(2) })),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(FlakyWorkflow);
        let actor = Actor::new(d, def).unwrap();
        let record = actor.start("wf1", serde_json::json!({})).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn transient_failure_records_retry_scheduled_events() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(FlakyWorkflow);
        let actor = Actor::new(d.clone(), def).unwrap();
        actor.start("wf1", serde_json::json!({})).await.unwrap();
        let events = d.store.get_events("wf1").await.unwrap();
        let retry_count = events.iter().filter(|e| matches!(e.event_type, EventType::RetryScheduled)).count();
        assert_eq!(retry_count, 2);
    }

    #[tokio::test]
    async fn starting_an_existing_workflow_id_fails() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: false });
        let actor = Actor::new(d, def).unwrap();
        actor.start("wf1", serde_json::json!({"n": 0})).await.unwrap();
        let err = actor.start("wf1", serde_json::json!({"n": 0})).await.unwrap_err();
        assert!(matches!(err, ActorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn permanent_step_failure_enqueues_workflow_failed_dlq_entry() {
        let d = deps();
        let def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflow { fail: true });
        let actor = Actor::new(d.clone(), def).unwrap();
        actor.start("wf1", serde_json::json!({})).await.unwrap();
        let entries = d.dlq.list(crate::model::DlqFilter::default(), 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].entry_type, DlqEntryType::WorkflowFailed));
        assert_eq!(entries[0].retry_count, 0);
    }

    struct CapturingStep {
        captured: Arc<Mutex<Option<Value>>>,
    }

    #[async_trait]
    impl Step for CapturingStep {
        async fn execute(&self, state: &State) -> Result<State, Failure> {
            *self.captured.lock() = state.get(IDEMPOTENCY_KEY_FIELD).cloned();
            Ok(state.clone())
        }
    }

    struct CapturingWorkflow {
        captured: Arc<Mutex<Option<Value>>>,
    }

    impl WorkflowDefinition for CapturingWorkflow {
        fn kind(&self) -> &str {
            "capturing"
        }
        fn graph(&self) -> Result<Graph, GraphError> {
            GraphBuilder::new().linear(vec![StepSpec::new("cap", "cap")])
        }
        fn initial_state(&self, _params: Value) -> Result<State, crate::contract::DefinitionError> {
            Ok(State::new())
        }
        fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
            match module {
                "cap" => Some(Arc::new(CapturingStep { captured: self.captured.clone() })),
                _ => None,
            }
        }
    }

    #[tokio::test]
    async fn idempotency_key_is_injected_into_step_input_state() {
        let d = deps();
        let captured = Arc::new(Mutex::new(None));
        let def: Arc<dyn WorkflowDefinition> = Arc::new(CapturingWorkflow { captured: captured.clone() });
        let actor = Actor::new(d, def).unwrap();
        actor.start("wf1", serde_json::json!({})).await.unwrap();
        let key = captured.lock().clone().expect("idempotency key should have been forwarded");
        assert_eq!(key, serde_json::json!("wf1:cap:1"));
    }
}

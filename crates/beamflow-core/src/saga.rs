//! Saga Compensator: LIFO rollback of side-effectful steps
//! when a workflow cannot be carried to completion.
//!
//! Each compensation call is itself routed through the Circuit Breaker and
//! Idempotency Ledger, under a key distinct from the step's own forward
//! invocation key, so a compensation can be retried safely after a crash
//! without re-running an already-undone effect.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{message_type, workflow_topic, EventBus};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::contract::WorkflowDefinition;
use crate::dlq::DeadLetterQueue;
use crate::error::Failure;
use crate::graph::{Graph, State};
use crate::idempotency::{BeginOutcome, IdempotencyLedger};
use crate::model::{DlqEntryType, WorkflowRecord};
use crate::retry::{RetryDecision, RetryPolicyBook};

fn compensation_key(workflow_id: &str, node_id: &str) -> String {
    format!("{workflow_id}:{node_id}:compensate")
}

/// Outcome of running the full LIFO compensation sweep for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SagaOutcome {
    /// Every executed side-effectful step compensated cleanly; the
    /// workflow settles into `failed`.
    AllCompensated,
    /// At least one compensation could not complete and was routed to the
    /// Dead-Letter Queue; the workflow settles into `abandoned`.
    Abandoned { failed_nodes: Vec<String> },
}

pub struct SagaCompensator {
    ledger: Arc<IdempotencyLedger>,
    breaker: Arc<CircuitBreakerRegistry>,
    retry_policies: RetryPolicyBook,
    dlq: Arc<DeadLetterQueue>,
    bus: Option<Arc<EventBus>>,
}

impl SagaCompensator {
    pub fn new(
        ledger: Arc<IdempotencyLedger>,
        breaker: Arc<CircuitBreakerRegistry>,
        dlq: Arc<DeadLetterQueue>,
    ) -> Self {
        Self {
            ledger,
            breaker,
            retry_policies: RetryPolicyBook::new(),
            dlq,
            bus: None,
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_retry_policies(mut self, policies: RetryPolicyBook) -> Self {
        self.retry_policies = policies;
        self
    }

    /// Walk `record.executed_saga_nodes` newest-first, compensating each
    /// one. A compensation failure does not stop the sweep: remaining
    /// nodes still get a chance to compensate (best-effort continuation),
    /// and the failure is routed to the DLQ as a critical
    /// entry so an operator can act on the partial rollback.
    pub async fn compensate(
        &self,
        record: &WorkflowRecord,
        graph: &Graph,
        definition: &Arc<dyn WorkflowDefinition>,
        state: &State,
    ) -> SagaOutcome {
        let mut failed_nodes = Vec::new();

        for node_id in record.executed_saga_nodes.iter().rev() {
            let Some(node) = graph.node(node_id) else {
                warn!(node = %node_id, "saga node missing from graph, skipping compensation");
                continue;
            };
            let Some(module) = &node.module else {
                continue;
            };
            let Some(step) = definition.step(module) else {
                warn!(module = %module, "no step registered for compensation module");
                continue;
            };

            let key = compensation_key(&record.id, node_id);
            match self.ledger.begin(&key).await {
                Ok(BeginOutcome::AlreadyCompleted { .. }) => {
                    info!(node = %node_id, "compensation already completed, skipping");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(node = %node_id, error = %e, "idempotency ledger unavailable during compensation");
                }
            }

            let policy = self.retry_policies.get(module);
            let mut attempt = 1u32;
            let outcome = loop {
                let breaker_name = module.as_str();
                let call_result = self
                    .breaker
                    .call(breaker_name, || step.compensate(state))
                    .await;

                let result = match call_result {
                    Ok(inner) => inner,
                    Err(_open) => Err(Failure::transient("circuit open")),
                };

                match result {
                    Ok(()) => break Ok(()),
                    Err(failure) => match policy.decide(&failure, attempt) {
                        RetryDecision::RetryAfter(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        RetryDecision::GiveUp { .. } => break Err(failure),
                    },
                }
            };

            match outcome {
                Ok(()) => match self.ledger.complete(&key, serde_json::Value::Bool(true)).await {
                    Ok(()) => {
                        self.publish_compensated(&record.id, node_id);
                        info!(node = %node_id, "compensation succeeded");
                    }
                    Err(e) => {
                        // The undo ran but the ledger never recorded it as done; a retry
                        // would re-run an already-reversed effect, so this counts as failed.
                        error!(node = %node_id, error = %e, "compensation ledger write failed, treating as unresolved");
                        let mut context = HashMap::new();
                        context.insert("node_id".to_string(), serde_json::json!(node_id));
                        if let Err(e) = self
                            .dlq
                            .enqueue(
                                DlqEntryType::CompensationFailed,
                                &record.id,
                                &record.kind,
                                Failure::transient(format!("compensation ledger write failed: {e}")),
                                context,
                                serde_json::to_value(state).unwrap_or_default(),
                            )
                            .await
                        {
                            warn!(node = %node_id, error = %e, "failed to enqueue compensation_failed dlq entry");
                        }
                        failed_nodes.push(node_id.clone());
                    }
                },
                Err(failure) => {
                    if let Err(e) = self.ledger.fail(&key, failure.clone()).await {
                        warn!(node = %node_id, error = %e, "idempotency ledger unavailable recording compensation failure");
                    }
                    error!(node = %node_id, error = %failure, "compensation failed, routing to dead-letter queue");
                    let mut context = HashMap::new();
                    context.insert("node_id".to_string(), serde_json::json!(node_id));
                    if let Err(e) = self
                        .dlq
                        .enqueue(
                            DlqEntryType::CompensationFailed,
                            &record.id,
                            &record.kind,
                            failure,
                            context,
                            serde_json::to_value(state).unwrap_or_default(),
                        )
                        .await
                    {
                        warn!(node = %node_id, error = %e, "failed to enqueue compensation_failed dlq entry");
                    }
                    failed_nodes.push(node_id.clone());
                }
            }
        }

        if failed_nodes.is_empty() {
            SagaOutcome::AllCompensated
        } else {
            SagaOutcome::Abandoned { failed_nodes }
        }
    }

    fn publish_compensated(&self, workflow_id: &str, node_id: &str) {
        if let Some(bus) = &self.bus {
            bus.publish(
                workflow_topic(workflow_id),
                message_type::SAGA_STEP_COMPENSATED,
                serde_json::json!({ "workflow_id": workflow_id, "node_id": node_id }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::contract::{DefinitionError, Step};
    use crate::graph::{GraphBuilder, StepSpec};
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct RecordingStep {
        calls: Arc<Mutex<Vec<String>>>,
        fail_always: bool,
    }

    #[async_trait]
    impl Step for RecordingStep {
        async fn execute(&self, state: &State) -> Result<State, Failure> {
            Ok(state.clone())
        }

        fn is_side_effectful(&self) -> bool {
            true
        }

        async fn compensate(&self, _state: &State) -> Result<(), Failure> {
            if self.fail_always {
                return Err(Failure::permanent("cannot undo"));
            }
            self.calls.lock().push("compensated".to_string());
            Ok(())
        }
    }

    struct TestWorkflow {
        calls: Arc<Mutex<Vec<String>>>,
        fail_always: bool,
    }

    impl WorkflowDefinition for TestWorkflow {
        fn kind(&self) -> &str {
            "saga_test"
        }

        fn graph(&self) -> Result<Graph, crate::graph::GraphError> {
            GraphBuilder::new().linear(vec![StepSpec::new("charge", "charge").side_effectful()])
        }

        fn initial_state(&self, _params: Value) -> Result<State, DefinitionError> {
            Ok(State::new())
        }

        fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
            match module {
                "charge" => Some(Arc::new(RecordingStep {
                    calls: self.calls.clone(),
                    fail_always: self.fail_always,
                })),
                _ => None,
            }
        }
    }

    fn compensator() -> SagaCompensator {
        let store = Arc::new(MemoryStore::new());
        let clock = Clock::manual(chrono::Utc::now());
        let ledger = Arc::new(IdempotencyLedger::new(store.clone(), clock.clone()));
        let breaker = Arc::new(CircuitBreakerRegistry::new(clock.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(store, clock));
        SagaCompensator::new(ledger, breaker, dlq)
    }

    #[tokio::test]
    async fn successful_compensation_reports_all_compensated() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let def: Arc<dyn WorkflowDefinition> = Arc::new(TestWorkflow { calls: calls.clone(), fail_always: false });
        let graph = def.graph().unwrap();
        let mut record = WorkflowRecord::new("wf1", "saga_test", chrono::Utc::now(), 1);
        record.executed_saga_nodes = vec!["charge".to_string()];

        let outcome = compensator().compensate(&record, &graph, &def, &State::new()).await;
        assert_eq!(outcome, SagaOutcome::AllCompensated);
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_compensation_is_abandoned_and_routed_to_dlq() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let def: Arc<dyn WorkflowDefinition> = Arc::new(TestWorkflow { calls, fail_always: true });
        let graph = def.graph().unwrap();
        let mut record = WorkflowRecord::new("wf1", "saga_test", chrono::Utc::now(), 1);
        record.executed_saga_nodes = vec!["charge".to_string()];

        let outcome = compensator().compensate(&record, &graph, &def, &State::new()).await;
        assert_eq!(
            outcome,
            SagaOutcome::Abandoned { failed_nodes: vec!["charge".to_string()] }
        );
    }

    #[tokio::test]
    async fn compensation_runs_in_lifo_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let order_tracker = calls.clone();

        struct OrderStep {
            id: &'static str,
            order: Arc<Mutex<Vec<String>>>,
        }

        #[async_trait]
        impl Step for OrderStep {
            async fn execute(&self, state: &State) -> Result<State, Failure> {
                Ok(state.clone())
            }
            fn is_side_effectful(&self) -> bool {
                true
            }
            async fn compensate(&self, _state: &State) -> Result<(), Failure> {
                self.order.lock().push(self.id.to_string());
                Ok(())
            }
        }

        struct MultiStepWorkflow {
            order: Arc<Mutex<Vec<String>>>,
        }

        impl WorkflowDefinition for MultiStepWorkflow {
            fn kind(&self) -> &str {
                "multi"
            }
            fn graph(&self) -> Result<Graph, crate::graph::GraphError> {
                GraphBuilder::new().linear(vec![
                    StepSpec::new("a", "a").side_effectful(),
                    StepSpec::new("b", "b").side_effectful(),
                ])
            }
            fn initial_state(&self, _params: Value) -> Result<State, DefinitionError> {
                Ok(State::new())
            }
            fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
                Some(Arc::new(OrderStep { id: Box::leak(module.to_string().into_boxed_str()), order: self.order.clone() }))
            }
        }

        let def: Arc<dyn WorkflowDefinition> = Arc::new(MultiStepWorkflow { order: order_tracker });
        let graph = def.graph().unwrap();
        let mut record = WorkflowRecord::new("wf1", "multi", chrono::Utc::now(), 2);
        record.executed_saga_nodes = vec!["a".to_string(), "b".to_string()];

        compensator().compensate(&record, &graph, &def, &State::new()).await;
        assert_eq!(*calls.lock(), vec!["b".to_string(), "a".to_string()]);
    }
}

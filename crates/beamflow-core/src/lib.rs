//! # BeamFlow
//!
//! A graph-based workflow orchestration kernel for reliable execution of
//! multi-step processes with automatic retries, circuit breaking, saga
//! compensation, and a dead-letter queue.
//!
//! ## Features
//!
//! - **Static graph execution**: workflows are compiled to a validated DAG
//!   of step/branch/dispatch/join nodes before a single instance runs
//! - **Exactly-once external effects**: an Idempotency Ledger serializes
//!   intent through durable state before and after every side-effectful call
//! - **Automatic retries**: configurable retry policies with exponential
//!   backoff and jitter
//! - **Circuit breakers**: protect external dependencies from cascading failures
//! - **Saga compensation**: LIFO rollback of completed side-effectful steps
//!   when a workflow cannot be carried to completion
//! - **Dead-letter queue**: durable record of terminal failures, retried on
//!   a schedule, with operator override operations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Supervisor                             │
//! │   (kind -> WorkflowDefinition registry, restart-storm bound) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Actor                                │
//! │  (walks the Graph node by node, drives Idempotency Ledger,  │
//! │   Circuit Breaker, Retry Policy, and Saga Compensator)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                                │
//! │    (workflows, events, idempotency entries, DLQ entries)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use beamflow_core::prelude::*;
//!
//! struct ChargeCard;
//!
//! #[async_trait::async_trait]
//! impl Step for ChargeCard {
//!     async fn execute(&self, state: &State) -> Result<State, Failure> {
//!         Ok(state.clone())
//!     }
//!     fn is_side_effectful(&self) -> bool { true }
//! }
//!
//! struct Checkout;
//!
//! impl WorkflowDefinition for Checkout {
//!     fn kind(&self) -> &str { "checkout" }
//!     fn graph(&self) -> Result<Graph, GraphError> {
//!         GraphBuilder::new().linear(vec![StepSpec::new("charge", "charge").side_effectful()])
//!     }
//!     fn initial_state(&self, params: serde_json::Value) -> Result<State, DefinitionError> {
//!         Ok(State::new())
//!     }
//!     fn step(&self, module: &str) -> Option<std::sync::Arc<dyn Step>> {
//!         match module {
//!             "charge" => Some(std::sync::Arc::new(ChargeCard)),
//!             _ => None,
//!         }
//!     }
//! }
//! ```

pub mod actor;
pub mod bus;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod contract;
pub mod dlq;
pub mod error;
pub mod graph;
pub mod idempotency;
pub mod model;
pub mod retry;
pub mod saga;
pub mod store;
pub mod supervisor;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::actor::{Actor, ActorDeps, ActorError, CancellationHandle};
    pub use crate::bus::{message_type, BusMessage, EventBus};
    pub use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use crate::clock::{Clock, Jitter};
    pub use crate::config::EngineConfig;
    pub use crate::contract::{CompensationMetadata, DefinitionError, Step, WorkflowDefinition, WorkflowRegistry};
    pub use crate::dlq::{DeadLetterQueue, DlqError};
    pub use crate::error::{Failure, FailureKind};
    pub use crate::graph::{Graph, GraphBuilder, GraphError, State, StepSpec, ValidationMode};
    pub use crate::idempotency::{BeginOutcome, IdempotencyLedger};
    pub use crate::model::{DlqEntry, EventRecord, WorkflowFilter, WorkflowRecord, WorkflowStatus};
    pub use crate::retry::{RetryDecision, RetryPolicy, RetryPolicyBook};
    pub use crate::saga::{SagaCompensator, SagaOutcome};
    pub use crate::store::{memory::MemoryStore, sqlite::SqliteStore, Store, StoreError};
    pub use crate::supervisor::{Supervisor, SupervisorError};
}

// Re-export key types at crate root.
pub use actor::{Actor, ActorDeps, ActorError};
pub use config::EngineConfig;
pub use contract::{Step, WorkflowDefinition, WorkflowRegistry};
pub use error::{Failure, FailureKind};
pub use graph::{Graph, GraphBuilder, GraphError};
pub use model::{WorkflowRecord, WorkflowStatus};
pub use store::{Store, StoreError};
pub use supervisor::{Supervisor, SupervisorError};

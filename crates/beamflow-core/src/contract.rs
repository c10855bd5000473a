//! Step / Workflow interfaces: the contracts user code
//! implements to plug into the kernel, plus the `kind -> definition`
//! registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::Failure;
use crate::graph::{Graph, GraphError, State};

/// Timeout and criticality metadata for a side-effectful step's
/// compensation.
#[derive(Debug, Clone)]
pub struct CompensationMetadata {
    pub timeout: std::time::Duration,
    pub critical: bool,
}

impl Default for CompensationMetadata {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            critical: true,
        }
    }
}

/// A node in the graph that runs user code and may mutate state.
#[async_trait]
pub trait Step: Send + Sync {
    /// Run the step, producing the next state or a classified failure.
    async fn execute(&self, state: &State) -> Result<State, Failure>;

    /// Optional pre-flight validation, run before `execute` is attempted.
    fn validate(&self, state: &State) -> Result<(), Failure> {
        let _ = state;
        Ok(())
    }

    /// Whether this step has observable effects outside the Store. A
    /// side-effectful step must override `compensate`.
    fn is_side_effectful(&self) -> bool {
        false
    }

    /// Undo a previously completed invocation. Only called for steps
    /// where `is_side_effectful` is true.
    async fn compensate(&self, state: &State) -> Result<(), Failure> {
        let _ = state;
        Ok(())
    }

    fn compensation_metadata(&self) -> CompensationMetadata {
        CompensationMetadata::default()
    }

    /// Per-invocation deadline. Exceeding it is a retriable transient
    /// failure, not a hang -- the Actor wraps `execute` in
    /// `tokio::time::timeout` using this value.
    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(300)
    }
}

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("unknown step module: {0}")]
    UnknownStep(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

/// A Workflow exposes a graph (built once, lazily, and shared read-only)
/// and the step modules its graph's `Step` nodes reference by name.
pub trait WorkflowDefinition: Send + Sync {
    /// The `kind` identifier used by `StartWorkflow` and the registry.
    fn kind(&self) -> &str;

    fn graph(&self) -> Result<Graph, GraphError>;

    fn initial_state(&self, params: Value) -> Result<State, DefinitionError>;

    fn step(&self, module: &str) -> Option<Arc<dyn Step>>;

    /// Called after a step completes successfully, to let the workflow
    /// fold the step's output into state beyond what `Step::execute`
    /// already returned (e.g. derived fields).
    fn handle_step_success(&self, _step: &str, state: State) -> State {
        state
    }

    /// Called after a step fails permanently, before the Actor decides
    /// between saga compensation and DLQ.
    fn handle_step_failure(&self, _step: &str, _reason: &Failure, state: State) -> State {
        state
    }
}

/// `kind -> WorkflowDefinition` registry, the explicit
/// replacement for the source's dynamic-module-lookup-by-name pattern.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<dyn WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: Arc<dyn WorkflowDefinition>) {
        self.definitions.insert(definition.kind().to_string(), definition);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn WorkflowDefinition>> {
        self.definitions.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.definitions.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, StepSpec};

    struct EchoStep;

    #[async_trait]
    impl Step for EchoStep {
        async fn execute(&self, state: &State) -> Result<State, Failure> {
            Ok(state.clone())
        }
    }

    struct EchoWorkflow;

    impl WorkflowDefinition for EchoWorkflow {
        fn kind(&self) -> &str {
            "echo"
        }

        fn graph(&self) -> Result<Graph, GraphError> {
            GraphBuilder::new().linear(vec![StepSpec::new("a", "echo")])
        }

        fn initial_state(&self, params: Value) -> Result<State, DefinitionError> {
            match params {
                Value::Object(map) => Ok(map.into_iter().collect()),
                _ => Err(DefinitionError::InvalidParams("expected object".into())),
            }
        }

        fn step(&self, module: &str) -> Option<Arc<dyn Step>> {
            match module {
                "echo" => Some(Arc::new(EchoStep)),
                _ => None,
            }
        }
    }

    #[test]
    fn registry_roundtrips_a_definition() {
        let mut reg = WorkflowRegistry::new();
        reg.register(Arc::new(EchoWorkflow));
        assert!(reg.contains("echo"));
        let def = reg.get("echo").unwrap();
        assert!(def.graph().is_ok());
    }
}

//! Graph builders for the two definition styles names: linear
//! (an ordered list of step identifiers) and explicit (nodes and edges,
//! including branch/dispatch). Both funnel through [`validate`] before a
//! [`super::Graph`] is handed to a Workflow Actor.

use std::collections::{HashMap, HashSet};

use super::validator::{validate, GraphError, ValidationMode};
use super::{Condition, DispatchKey, Edge, Graph, Node, NodeKind};

/// A step to add to the graph, with enough metadata for the Saga
/// Compensator to know whether it needs a compensation entry.
#[derive(Clone)]
pub struct StepSpec {
    pub id: String,
    pub module: String,
    pub is_side_effectful: bool,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            module: module.into(),
            is_side_effectful: false,
        }
    }

    pub fn side_effectful(mut self) -> Self {
        self.is_side_effectful = true;
        self
    }
}

/// Builds a [`Graph`] from either a linear step list or explicit
/// node/edge construction. `start`/`end` sentinel nodes are always
/// synthesized so every graph has exactly one entry and at least one
/// terminal, matching `start_node`/`end_nodes` fields.
pub struct GraphBuilder {
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Vec<Edge>>,
    end_nodes: HashSet<String>,
    validation_mode: ValidationMode,
}

const START: &str = "__start__";

impl GraphBuilder {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            START.to_string(),
            Node { id: START.to_string(), kind: NodeKind::Start, module: None },
        );
        Self {
            nodes,
            edges: HashMap::new(),
            end_nodes: HashSet::new(),
            validation_mode: ValidationMode::Normal,
        }
    }

    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.validation_mode = mode;
        self
    }

    /// Linear style: `[A, B, C]` becomes `start -> A -> B -> C -> end`.
    pub fn linear(mut self, steps: Vec<StepSpec>) -> Result<Graph, GraphError> {
        let mut prev = START.to_string();
        for step in steps {
            self.add_step(step.clone());
            self.connect(&prev, &step.id);
            prev = step.id;
        }
        let end = self.end_node_id();
        self.connect(&prev, &end);
        self.finish()
    }

    /// Explicit style: caller adds steps/branches/dispatches/joins and
    /// wires edges manually, then calls `finish`.
    pub fn add_step(&mut self, step: StepSpec) -> &mut Self {
        self.nodes.insert(
            step.id.clone(),
            Node {
                id: step.id.clone(),
                kind: NodeKind::Step { is_side_effectful: step.is_side_effectful },
                module: Some(step.module),
            },
        );
        self
    }

    pub fn add_join(&mut self, id: impl Into<String>) -> &mut Self {
        let id = id.into();
        self.nodes.insert(id.clone(), Node { id, kind: NodeKind::Join, module: None });
        self
    }

    pub fn add_branch(
        &mut self,
        id: impl Into<String>,
        condition: Condition,
        default: Option<String>,
    ) -> &mut Self {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            Node { id, kind: NodeKind::Branch { condition, default }, module: None },
        );
        self
    }

    pub fn add_dispatch(
        &mut self,
        id: impl Into<String>,
        key: DispatchKey,
        routes: HashMap<String, String>,
        default: impl Into<String>,
    ) -> &mut Self {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            Node {
                id,
                kind: NodeKind::Dispatch { key, routes, default: default.into() },
                module: None,
            },
        );
        self
    }

    /// Single unlabeled edge (step/join/start successors).
    pub fn connect(&mut self, from: &str, to: &str) -> &mut Self {
        self.edges
            .entry(from.to_string())
            .or_default()
            .push(Edge { label: None, target: to.to_string() });
        self
    }

    /// Labeled edge (branch/dispatch successors).
    pub fn connect_labeled(&mut self, from: &str, label: impl Into<String>, to: &str) -> &mut Self {
        self.edges
            .entry(from.to_string())
            .or_default()
            .push(Edge { label: Some(label.into()), target: to.to_string() });
        self
    }

    pub fn start_node_id(&self) -> &str {
        START
    }

    pub fn end_node_id(&mut self) -> String {
        let id = format!("__end_{}__", self.end_nodes.len());
        self.nodes.insert(id.clone(), Node { id: id.clone(), kind: NodeKind::End, module: None });
        self.end_nodes.insert(id.clone());
        id
    }

    pub fn finish(self) -> Result<Graph, GraphError> {
        let graph = Graph {
            nodes: self.nodes,
            edges: self.edges,
            start_node: START.to_string(),
            end_nodes: self.end_nodes,
        };
        validate(&graph, self.validation_mode)?;
        Ok(graph)
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

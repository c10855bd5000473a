//! Graph & Builder: a typed DAG with branch/dispatch/join
//! nodes and a static validator.

mod builder;
mod validator;

pub use builder::{GraphBuilder, StepSpec};
pub use validator::{validate, GraphError, ValidationMode};

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// The state the workflow carries between nodes -- the same shape as
/// `WorkflowRecord.state` in the data model.
pub type State = HashMap<String, Value>;

/// A branch predicate: inspects state, returns the edge label to follow.
pub type Condition = Arc<dyn Fn(&State) -> String + Send + Sync>;

/// A dispatch key function: inspects state, returns the lookup key.
pub type DispatchKey = Arc<dyn Fn(&State) -> String + Send + Sync>;

#[derive(Clone)]
pub enum NodeKind {
    Start,
    End,
    Step { is_side_effectful: bool },
    Join,
    /// A branch selects one of its labeled outgoing edges by evaluating
    /// `condition` against state; `default` names the edge label used when
    /// no label returned by `condition` matches (or `condition` opts out).
    Branch { condition: Condition, default: Option<String> },
    /// A dispatch branch picks a successor by exact map lookup on
    /// `key(state)`, falling back to `default` (always present).
    Dispatch {
        key: DispatchKey,
        routes: HashMap<String, String>,
        default: String,
    },
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Start => write!(f, "Start"),
            NodeKind::End => write!(f, "End"),
            NodeKind::Step { is_side_effectful } => {
                write!(f, "Step {{ is_side_effectful: {is_side_effectful} }}")
            }
            NodeKind::Join => write!(f, "Join"),
            NodeKind::Branch { default, .. } => write!(f, "Branch {{ default: {default:?} }}"),
            NodeKind::Dispatch { routes, default, .. } => {
                write!(f, "Dispatch {{ routes: {routes:?}, default: {default} }}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// User-code module identifier resolved by the registry for `Step` nodes.
    pub module: Option<String>,
}

/// A single outgoing edge. `label` is `None` for step/join/start edges
/// (which have exactly one unlabeled successor) and `Some(label)` for
/// branch/dispatch edges.
#[derive(Debug, Clone)]
pub struct Edge {
    pub label: Option<String>,
    pub target: String,
}

/// An in-memory, immutable, shareable DAG.
#[derive(Debug, Clone)]
pub struct Graph {
    pub nodes: HashMap<String, Node>,
    pub edges: HashMap<String, Vec<Edge>>,
    pub start_node: String,
    pub end_nodes: std::collections::HashSet<String>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn step_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Step { .. }))
    }

    /// Runtime helper: resolve the single successor for the
    /// current node given the current state.
    pub fn next_nodes(&self, current_id: &str, state: &State) -> Option<String> {
        let node = self.nodes.get(current_id)?;
        let edges = self.edges.get(current_id)?;

        match &node.kind {
            NodeKind::Start | NodeKind::Step { .. } | NodeKind::Join => {
                edges.first().map(|e| e.target.clone())
            }
            NodeKind::Branch { condition, default } => {
                let label = condition(state);
                edges
                    .iter()
                    .find(|e| e.label.as_deref() == Some(label.as_str()))
                    .or_else(|| {
                        default
                            .as_ref()
                            .and_then(|d| edges.iter().find(|e| e.label.as_deref() == Some(d.as_str())))
                    })
                    .map(|e| e.target.clone())
            }
            NodeKind::Dispatch { key, routes, default } => {
                let k = key(state);
                let target_label = routes.get(&k).unwrap_or(default);
                edges
                    .iter()
                    .find(|e| e.label.as_deref() == Some(target_label.as_str()))
                    .map(|e| e.target.clone())
            }
            NodeKind::End => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_graph() -> Graph {
        let mut nodes = HashMap::new();
        nodes.insert("start".into(), Node { id: "start".into(), kind: NodeKind::Start, module: None });
        nodes.insert(
            "a".into(),
            Node { id: "a".into(), kind: NodeKind::Step { is_side_effectful: false }, module: Some("a".into()) },
        );
        nodes.insert("end".into(), Node { id: "end".into(), kind: NodeKind::End, module: None });

        let mut edges = HashMap::new();
        edges.insert("start".into(), vec![Edge { label: None, target: "a".into() }]);
        edges.insert("a".into(), vec![Edge { label: None, target: "end".into() }]);

        Graph {
            nodes,
            edges,
            start_node: "start".into(),
            end_nodes: ["end".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn next_nodes_follows_single_edge() {
        let g = linear_graph();
        let state = State::new();
        assert_eq!(g.next_nodes("start", &state), Some("a".into()));
        assert_eq!(g.next_nodes("a", &state), Some("end".into()));
        assert_eq!(g.next_nodes("end", &state), None);
    }

    #[test]
    fn next_nodes_evaluates_branch_condition() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "b".into(),
            Node {
                id: "b".into(),
                kind: NodeKind::Branch {
                    condition: Arc::new(|s: &State| {
                        if s.get("x").and_then(|v| v.as_i64()) == Some(1) {
                            "yes".into()
                        } else {
                            "no".into()
                        }
                    }),
                    default: Some("no".into()),
                },
                module: None,
            },
        );
        let mut edges = HashMap::new();
        edges.insert(
            "b".into(),
            vec![
                Edge { label: Some("yes".into()), target: "t_yes".into() },
                Edge { label: Some("no".into()), target: "t_no".into() },
            ],
        );
        let g = Graph {
            nodes,
            edges,
            start_node: "b".into(),
            end_nodes: Default::default(),
        };
        let mut state = State::new();
        state.insert("x".into(), serde_json::json!(1));
        assert_eq!(g.next_nodes("b", &state), Some("t_yes".into()));
        state.insert("x".into(), serde_json::json!(2));
        assert_eq!(g.next_nodes("b", &state), Some("t_no".into()));
    }
}

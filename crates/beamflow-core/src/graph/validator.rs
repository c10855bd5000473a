//! Static graph validator.

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

use super::{Graph, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Normal,
    Strict,
    Paranoid,
    Pedantic,
}

impl ValidationMode {
    /// Branch-width ceiling below which a non-dispatch branch may omit a
    /// `default`. The ceiling is only ever lowered by a stricter mode,
    /// never raised above the default of 5 -- "a deliberate safety
    /// asymmetry".
    pub fn branch_width_threshold(self) -> usize {
        match self {
            ValidationMode::Normal => 5,
            ValidationMode::Strict => 3,
            ValidationMode::Paranoid => 2,
            ValidationMode::Pedantic => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node '{0}' is unreachable from start")]
    UnreachableNode(String),
    #[error("edge from '{from}' references missing node '{to}'")]
    DanglingEdge { from: String, to: String },
    #[error("dispatch node '{0}' has no default target")]
    MissingDefault(String),
    #[error("branch node '{node}' has {options} options (threshold {threshold}) without a default")]
    BranchTooWide { node: String, options: usize, threshold: usize },
}

/// Validate structural invariants of a graph. `mode` governs only
/// the `branch_too_wide` threshold; the other checks are unconditional.
pub fn validate(graph: &Graph, mode: ValidationMode) -> Result<(), GraphError> {
    check_dangling_edges(graph)?;
    check_reachability(graph)?;
    check_dispatch_defaults(graph)?;
    check_branch_width(graph, mode)?;
    Ok(())
}

fn check_dangling_edges(graph: &Graph) -> Result<(), GraphError> {
    for (from, edges) in &graph.edges {
        if !graph.nodes.contains_key(from) {
            return Err(GraphError::DanglingEdge { from: from.clone(), to: String::new() });
        }
        for edge in edges {
            if !graph.nodes.contains_key(&edge.target) {
                return Err(GraphError::DanglingEdge {
                    from: from.clone(),
                    to: edge.target.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_reachability(graph: &Graph) -> Result<(), GraphError> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(graph.start_node.as_str());
    visited.insert(graph.start_node.as_str());

    while let Some(id) = queue.pop_front() {
        if let Some(edges) = graph.edges.get(id) {
            for edge in edges {
                if visited.insert(edge.target.as_str()) {
                    queue.push_back(edge.target.as_str());
                }
            }
        }
    }

    for id in graph.nodes.keys() {
        if !visited.contains(id.as_str()) {
            return Err(GraphError::UnreachableNode(id.clone()));
        }
    }
    Ok(())
}

fn check_dispatch_defaults(graph: &Graph) -> Result<(), GraphError> {
    for node in graph.nodes.values() {
        if let NodeKind::Dispatch { default, .. } = &node.kind {
            let edges = graph.edges.get(&node.id);
            let has_default_edge = edges
                .map(|es| es.iter().any(|e| e.label.as_deref() == Some(default.as_str())))
                .unwrap_or(false);
            if default.is_empty() || !has_default_edge {
                return Err(GraphError::MissingDefault(node.id.clone()));
            }
        }
    }
    Ok(())
}

/// Implements the resolution of the `pedantic`/threshold-1 open
/// question: a branch node at threshold 1 must have a `default` even if
/// it exposes only a single labeled option. See DESIGN.md.
fn check_branch_width(graph: &Graph, mode: ValidationMode) -> Result<(), GraphError> {
    let threshold = mode.branch_width_threshold();
    for node in graph.nodes.values() {
        if let NodeKind::Branch { default, .. } = &node.kind {
            let options = graph.edges.get(&node.id).map(|e| e.len()).unwrap_or(0);
            if default.is_none() && options > threshold {
                return Err(GraphError::BranchTooWide {
                    node: node.id.clone(),
                    options,
                    threshold,
                });
            }
            // At threshold 1, even a single-option branch without a
            // default is rejected: the `pedantic` mode must reject an
            // unguarded branch outright, not just "too many" options.
            if default.is_none() && threshold <= 1 && options >= 1 {
                return Err(GraphError::BranchTooWide {
                    node: node.id.clone(),
                    options,
                    threshold,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Graph, Node, NodeKind};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn base_graph() -> (HashMap<String, Node>, HashMap<String, Vec<Edge>>) {
        let mut nodes = HashMap::new();
        nodes.insert("start".into(), Node { id: "start".into(), kind: NodeKind::Start, module: None });
        nodes.insert("end".into(), Node { id: "end".into(), kind: NodeKind::End, module: None });
        (nodes, HashMap::new())
    }

    #[test]
    fn unreachable_node_rejected() {
        let (mut nodes, mut edges) = base_graph();
        nodes.insert(
            "orphan".into(),
            Node { id: "orphan".into(), kind: NodeKind::Step { is_side_effectful: false }, module: None },
        );
        edges.insert("start".into(), vec![Edge { label: None, target: "end".into() }]);
        let graph = Graph { nodes, edges, start_node: "start".into(), end_nodes: ["end".into()].into() };
        assert_eq!(validate(&graph, ValidationMode::Normal), Err(GraphError::UnreachableNode("orphan".into())));
    }

    #[test]
    fn dangling_edge_rejected() {
        let (nodes, mut edges) = base_graph();
        edges.insert("start".into(), vec![Edge { label: None, target: "ghost".into() }]);
        let graph = Graph { nodes, edges, start_node: "start".into(), end_nodes: ["end".into()].into() };
        assert!(matches!(validate(&graph, ValidationMode::Normal), Err(GraphError::DanglingEdge { .. })));
    }

    #[test]
    fn dispatch_without_default_rejected() {
        let (mut nodes, mut edges) = base_graph();
        nodes.insert(
            "d".into(),
            Node {
                id: "d".into(),
                kind: NodeKind::Dispatch {
                    key: Arc::new(|_| "x".into()),
                    routes: HashMap::new(),
                    default: "missing_edge".into(),
                },
                module: None,
            },
        );
        edges.insert("start".into(), vec![Edge { label: None, target: "d".into() }]);
        edges.insert("d".into(), vec![Edge { label: Some("other".into()), target: "end".into() }]);
        let graph = Graph { nodes, edges, start_node: "start".into(), end_nodes: ["end".into()].into() };
        assert_eq!(validate(&graph, ValidationMode::Normal), Err(GraphError::MissingDefault("d".into())));
    }

    #[test]
    fn branch_too_wide_without_default_b4() {
        let (mut nodes, mut edges) = base_graph();
        nodes.insert(
            "b".into(),
            Node {
                id: "b".into(),
                kind: NodeKind::Branch { condition: Arc::new(|_| "x".into()), default: None },
                module: None,
            },
        );
        edges.insert("start".into(), vec![Edge { label: None, target: "b".into() }]);
        edges.insert(
            "b".into(),
            vec![
                Edge { label: Some("1".into()), target: "end".into() },
                Edge { label: Some("2".into()), target: "end".into() },
            ],
        );
        let graph = Graph { nodes, edges, start_node: "start".into(), end_nodes: ["end".into()].into() };
        // pedantic (threshold 1): any option count without default is rejected
        assert!(matches!(
            validate(&graph, ValidationMode::Pedantic),
            Err(GraphError::BranchTooWide { .. })
        ));
        // normal (threshold 5): 2 options without default is fine
        assert!(validate(&graph, ValidationMode::Normal).is_ok());
    }
}

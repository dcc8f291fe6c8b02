//! Task node data model.
//!
//! A `TaskNode` is one vertex of a dependency graph: an identity, a kind
//! (does it produce an artifact or a sub-graph), and the contracts its
//! output is checked against. Retries never change a node; attempt state
//! lives on the `Unit` executing it.

use crate::core::contract::{EdgeContract, ObjectContract, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifier of a node, unique within its owning graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Whether a node yields a terminal artifact or a sub-graph of child units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Produces the final artifact directly.
    #[default]
    Leaf,
    /// Produces a blueprint whose nodes are executed recursively.
    Structural,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Leaf => write!(f, "leaf"),
            NodeKind::Structural => write!(f, "structural"),
        }
    }
}

/// One vertex of a task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: NodeId,
    /// What the node should accomplish, handed to the implementation.
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: NodeKind,
    pub object_contract: ObjectContract,
    /// Integration rule per incoming dependency. Filled in by
    /// `TaskGraph::build` from the graph's edges.
    #[serde(default)]
    pub edge_contracts: BTreeMap<NodeId, EdgeContract>,
}

impl TaskNode {
    /// Create a leaf node whose object contract is `rule`.
    pub fn leaf(id: impl Into<NodeId>, description: &str, rule: &str) -> Self {
        Self {
            id: id.into(),
            description: description.to_string(),
            kind: NodeKind::Leaf,
            object_contract: ObjectContract::new(rule),
            edge_contracts: BTreeMap::new(),
        }
    }

    /// Create a structural node whose object contract is `rule`.
    pub fn structural(id: impl Into<NodeId>, description: &str, rule: &str) -> Self {
        Self {
            kind: NodeKind::Structural,
            ..Self::leaf(id, description, rule)
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.object_contract.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.object_contract.thresholds
    }

    pub fn is_structural(&self) -> bool {
        self.kind == NodeKind::Structural
    }

    /// Copy of this node that runs as a leaf, used once the recursion depth
    /// limit is reached.
    pub fn as_leaf(&self) -> Self {
        Self {
            kind: NodeKind::Leaf,
            ..self.clone()
        }
    }

    /// Render the object rule and every integration rule as plain text.
    pub fn contract_text(&self) -> String {
        let mut s = format!("OBJECT CONTRACT ({}):\n{}\n", self.id, self.object_contract.rule);
        if !self.edge_contracts.is_empty() {
            s.push_str("\nINTEGRATION CONTRACTS:\n");
            for (source, edge) in &self.edge_contracts {
                s.push_str(&format!("- from '{}': {}\n", source, edge.rule));
            }
        }
        s
    }
}

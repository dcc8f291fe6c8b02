//! Task graph (directed acyclic graph) for dependency management.
//!
//! `TaskGraph::build` is the only way to obtain a graph, so every graph in
//! the system has already passed the structural checks: unique node ids, no
//! edge pointing at a missing node, no cycle. Execution order and the
//! independent groups used for parallel fan-out are derived from it.

use crate::core::contract::{EdgeContract, Thresholds};
use crate::core::node::{NodeId, NodeKind, TaskNode};
use crate::error::{Result, TopologyError};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A dependency edge: `to` consumes the validated output of `from`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: NodeId,
    pub to: NodeId,
    /// Integration rule checked on `to` against `from`'s artifact.
    #[serde(default)]
    pub rule: String,
}

impl EdgeSpec {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>, rule: &str) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            rule: rule.to_string(),
        }
    }
}

/// The dependency graph of one blueprint.
///
/// Nodes keep their insertion order (petgraph assigns indices sequentially),
/// which is what breaks ties between independent nodes.
pub struct TaskGraph {
    graph: DiGraph<TaskNode, EdgeContract>,
    node_index: HashMap<NodeId, NodeIndex>,
}

impl TaskGraph {
    /// Build a graph from nodes and edges.
    ///
    /// # Errors
    /// - `DuplicateNode` if two nodes share an id
    /// - `DanglingEdge` if an edge references a node not in `nodes`
    /// - `Cycle` if the edges form a cycle (a self-loop is a cycle)
    pub fn build(
        nodes: Vec<TaskNode>,
        edges: Vec<EdgeSpec>,
    ) -> std::result::Result<Self, TopologyError> {
        let mut graph = DiGraph::with_capacity(nodes.len(), edges.len());
        let mut node_index = HashMap::with_capacity(nodes.len());

        for mut node in nodes {
            if node_index.contains_key(&node.id) {
                return Err(TopologyError::duplicate_node(format!(
                    "node '{}' is declared more than once",
                    node.id
                )));
            }
            // Edge contracts are derived from the edges below.
            node.edge_contracts.clear();
            let id = node.id.clone();
            let index = graph.add_node(node);
            node_index.insert(id, index);
        }

        for edge in edges {
            let from = *node_index.get(&edge.from).ok_or_else(|| {
                TopologyError::dangling_edge(format!(
                    "edge {} -> {} references missing node '{}'",
                    edge.from, edge.to, edge.from
                ))
            })?;
            let to = *node_index.get(&edge.to).ok_or_else(|| {
                TopologyError::dangling_edge(format!(
                    "edge {} -> {} references missing node '{}'",
                    edge.from, edge.to, edge.to
                ))
            })?;

            if from == to {
                return Err(TopologyError::cycle(format!(
                    "node '{}' depends on itself",
                    edge.from
                )));
            }

            let contract = EdgeContract::new(edge.rule);
            // A repeated edge replaces the earlier rule instead of doubling the dependency.
            match graph.find_edge(from, to) {
                Some(existing) => graph[existing] = contract.clone(),
                None => {
                    graph.add_edge(from, to, contract.clone());
                }
            }
            graph[to].edge_contracts.insert(edge.from, contract);
        }

        // Depth-first search over the whole graph; reports one node on the cycle.
        toposort(&graph, None).map_err(|cycle| {
            TopologyError::cycle(format!(
                "cycle detected through node '{}'",
                graph[cycle.node_id()].id
            ))
        })?;

        Ok(Self { graph, node_index })
    }

    /// A graph holding a single node and no edges.
    pub fn single(node: TaskNode) -> Self {
        let mut graph = DiGraph::new();
        let id = node.id.clone();
        let index = graph.add_node(node);
        let mut node_index = HashMap::new();
        node_index.insert(id, index);
        Self { graph, node_index }
    }

    /// Get a node by its id.
    pub fn node(&self, id: &NodeId) -> Option<&TaskNode> {
        self.node_index.get(id).map(|&index| &self.graph[index])
    }

    /// All nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_indices().map(move |index| &self.graph[index])
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node_index.contains_key(id)
    }

    /// Check if `to` directly depends on `from`.
    pub fn has_dependency(&self, from: &NodeId, to: &NodeId) -> bool {
        match (self.node_index.get(from), self.node_index.get(to)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Direct dependencies (predecessors) of a node, in insertion order.
    pub fn dependencies(&self, id: &NodeId) -> Vec<&NodeId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents (successors) of a node, in insertion order.
    pub fn dependents(&self, id: &NodeId) -> Vec<&NodeId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &NodeId, direction: Direction) -> Vec<&NodeId> {
        let Some(&index) = self.node_index.get(id) else {
            return Vec::new();
        };
        let mut indices: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        indices.sort();
        indices.dedup();
        indices.into_iter().map(|i| &self.graph[i].id).collect()
    }

    /// One valid linear extension of the graph.
    ///
    /// Kahn's algorithm with a min-heap on insertion index, so whenever
    /// several nodes are ready the earliest declared one goes first.
    pub fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<NodeIndex>> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(self.graph[index].id.clone());
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }
        order
    }

    /// Partition the nodes into groups that may run concurrently.
    ///
    /// Group `k` holds every node whose dependencies all sit in groups
    /// `0..k`; no two members of a group are connected by a path. Members
    /// are listed in insertion order.
    pub fn independent_groups(&self) -> Vec<Vec<NodeId>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();

        let mut layer: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| in_degree[i.index()] == 0)
            .collect();

        let mut groups = Vec::new();
        while !layer.is_empty() {
            let mut next_layer = Vec::new();
            for &index in &layer {
                for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                    in_degree[next.index()] -= 1;
                    if in_degree[next.index()] == 0 {
                        next_layer.push(next);
                    }
                }
            }
            groups.push(layer.iter().map(|&i| self.graph[i].id.clone()).collect());
            next_layer.sort();
            layer = next_layer;
        }
        groups
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.len())
            .field("edges", &self.edge_count())
            .finish()
    }
}

impl std::fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "NODES:")?;
        for id in self.topological_order() {
            if let Some(node) = self.node(&id) {
                writeln!(f, "  {:<20} [{}] {}", node.id, node.kind, node.description)?;
            }
        }
        writeln!(f, "DEPENDENCIES:")?;
        if self.edge_count() == 0 {
            writeln!(f, "  (none)")?;
        }
        for edge in self.graph.edge_indices() {
            if let Some((from, to)) = self.graph.edge_endpoints(edge) {
                writeln!(
                    f,
                    "  {} -> {} ({})",
                    self.graph[from].id, self.graph[to].id, self.graph[edge].rule
                )?;
            }
        }
        Ok(())
    }
}

/// The sub-graph produced by a structural node's implementation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub nodes: Vec<TaskNode>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

/// Node entry of the planner's JSON output.
#[derive(Debug, Deserialize)]
struct PlannedNode {
    id: String,
    description: String,
    spec: String,
    #[serde(default)]
    is_complex: bool,
    #[serde(default)]
    thresholds: Option<Thresholds>,
}

/// The planner's JSON output: `{"nodes": [...], "edges": [...]}`.
#[derive(Debug, Deserialize)]
struct PlannedBlueprint {
    nodes: Vec<PlannedNode>,
    #[serde(default)]
    edges: Vec<EdgeSpec>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: TaskNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, from: &str, to: &str, rule: &str) -> Self {
        self.edges.push(EdgeSpec::new(from, to, rule));
        self
    }

    /// Parse the planner format, where nodes carry `spec` and `is_complex`
    /// instead of an object contract and a kind.
    pub fn from_plan_json(json: &str) -> Result<Self> {
        let planned: PlannedBlueprint = serde_json::from_str(json)?;
        let nodes = planned
            .nodes
            .into_iter()
            .map(|n| {
                let mut node = if n.is_complex {
                    TaskNode::structural(n.id, &n.description, &n.spec)
                } else {
                    TaskNode::leaf(n.id, &n.description, &n.spec)
                };
                if let Some(thresholds) = n.thresholds {
                    node = node.with_thresholds(thresholds);
                }
                node
            })
            .collect();
        Ok(Self {
            nodes,
            edges: planned.edges,
        })
    }

    /// Number of structural nodes in the blueprint.
    pub fn structural_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Structural)
            .count()
    }

    /// Run the structural checks and produce the executable graph.
    pub fn into_graph(self) -> std::result::Result<TaskGraph, TopologyError> {
        TaskGraph::build(self.nodes, self.edges)
    }
}

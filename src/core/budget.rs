//! Error budget accumulator.
//!
//! For every stage path (a chain of stages whose artifacts feed each
//! other) the budget keeps the object error of each passed stage and the
//! composition discrepancy δ, and exposes the linear bound
//! `Σεᵢ + δ·(n-1)`.
//!
//! A stage is identified by the full scope of the unit that passed it, so
//! a node id reused at another depth is a different stage.
//!
//! A budget is never shared between concurrent branches. A branch works on
//! a `fork` of its incoming path and the parent `merge`s the branch's
//! budget back once the branch is terminal.

use crate::core::node::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A chain of node ids. A unit's scope is the path from the root unit
/// down to the unit itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionPath(Vec<NodeId>);

impl ExecutionPath {
    /// The empty path, before any stage.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: &[&str]) -> Self {
        Self(ids.iter().map(|id| NodeId::from(*id)).collect())
    }

    /// This path followed by one more node.
    pub fn extend(&self, id: &NodeId) -> Self {
        let mut ids = self.0.clone();
        ids.push(id.clone());
        Self(ids)
    }

    /// The path without its last node.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.0
    }
}

impl std::fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        let joined: Vec<&str> = self.0.iter().map(|id| id.as_str()).collect();
        write!(f, "{}", joined.join("/"))
    }
}

/// A chain of passed stages, from the first to the last. Each stage is the
/// scope of the unit that passed it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StagePath(Vec<ExecutionPath>);

impl StagePath {
    /// The empty path, before any stage.
    pub fn root() -> Self {
        Self::default()
    }

    /// Build a path from scopes written as `parent/child`.
    pub fn from_scopes(scopes: &[&str]) -> Self {
        Self(
            scopes
                .iter()
                .map(|scope| ExecutionPath(scope.split('/').map(NodeId::from).collect()))
                .collect(),
        )
    }

    /// This path followed by the stage passed by the unit at `scope`.
    pub fn then(&self, scope: &ExecutionPath) -> Self {
        let mut stages = self.0.clone();
        stages.push(scope.clone());
        Self(stages)
    }

    /// The path without its last stage.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last(&self) -> Option<&ExecutionPath> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn stages(&self) -> &[ExecutionPath] {
        &self.0
    }

    /// Node id of each stage.
    pub fn ids(&self) -> Vec<&NodeId> {
        self.0.iter().filter_map(ExecutionPath::last).collect()
    }
}

/// Renders each stage by its node id, e.g. `db/api/ui`.
impl std::fmt::Display for StagePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        let joined: Vec<&str> = self.ids().into_iter().map(NodeId::as_str).collect();
        write!(f, "{}", joined.join("/"))
    }
}

/// Recorded stages of one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathTally {
    /// Object error of each recorded stage, in order.
    pub stage_errors: Vec<f64>,
    /// Largest composition discrepancy recorded on the path.
    pub discrepancy: f64,
}

impl PathTally {
    pub fn stages(&self) -> usize {
        self.stage_errors.len()
    }

    pub fn error_sum(&self) -> f64 {
        self.stage_errors.iter().sum()
    }

    /// `Σεᵢ + δ·max(0, n-1)`.
    pub fn bound(&self) -> f64 {
        self.error_sum() + self.discrepancy * self.stages().saturating_sub(1) as f64
    }
}

/// Running totals of per-stage error, keyed by stage path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBudget {
    tallies: BTreeMap<StagePath, PathTally>,
}

impl ErrorBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage to `path`.
    ///
    /// The first record on a path starts from the tally of the path's
    /// parent, so a path always accounts for every stage leading to it.
    pub fn record(&mut self, path: &StagePath, epsilon: f64, discrepancy: f64) {
        if !self.tallies.contains_key(path) {
            let inherited = path
                .parent()
                .and_then(|parent| self.tallies.get(&parent).cloned())
                .unwrap_or_default();
            self.tallies.insert(path.clone(), inherited);
        }
        if let Some(tally) = self.tallies.get_mut(path) {
            tally.stage_errors.push(epsilon);
            tally.discrepancy = tally.discrepancy.max(discrepancy);
        }
    }

    /// Linear bound for `path`; 0.0 for a path with no recorded stage.
    pub fn bound(&self, path: &StagePath) -> f64 {
        self.tallies.get(path).map(PathTally::bound).unwrap_or(0.0)
    }

    /// Number of stages recorded on `path`.
    pub fn stages(&self, path: &StagePath) -> usize {
        self.tallies.get(path).map(PathTally::stages).unwrap_or(0)
    }

    pub fn tally(&self, path: &StagePath) -> Option<&PathTally> {
        self.tallies.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &StagePath> {
        self.tallies.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }

    /// A new budget holding only `path`'s tally, for a branch that
    /// continues from `path`.
    pub fn fork(&self, path: &StagePath) -> Self {
        let mut tallies = BTreeMap::new();
        if let Some(tally) = self.tallies.get(path) {
            tallies.insert(path.clone(), tally.clone());
        }
        Self { tallies }
    }

    /// Fold a terminal branch's budget into this one. When both hold the
    /// same path, the tally with more stages wins.
    pub fn merge(&mut self, other: ErrorBudget) {
        for (path, tally) in other.tallies {
            match self.tallies.get(&path) {
                Some(existing) if existing.stages() >= tally.stages() => {}
                _ => {
                    self.tallies.insert(path, tally);
                }
            }
        }
    }

    /// Path with the largest bound. Ties go to the longer path, then to the
    /// first in path order.
    pub fn critical_path(&self) -> Option<(&StagePath, f64)> {
        let mut best: Option<(&StagePath, f64)> = None;
        for (path, tally) in &self.tallies {
            let bound = tally.bound();
            let better = match best {
                None => true,
                Some((best_path, best_bound)) => {
                    bound > best_bound || (bound == best_bound && path.len() > best_path.len())
                }
            };
            if better {
                best = Some((path, bound));
            }
        }
        best
    }

    /// Among `candidates`, the recorded path with the largest bound.
    pub fn worst_of<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a StagePath>,
    ) -> Option<&'a StagePath> {
        let mut best: Option<(&'a StagePath, f64)> = None;
        for path in candidates {
            let bound = self.bound(path);
            let better = match best {
                None => true,
                Some((best_path, best_bound)) => {
                    bound > best_bound || (bound == best_bound && path.len() > best_path.len())
                }
            };
            if better {
                best = Some((path, bound));
            }
        }
        best.map(|(path, _)| path)
    }
}

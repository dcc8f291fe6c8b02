//! Run outcomes and partial-result assembly.
//!
//! When the root unit cannot pass, the engine hands its failure chain and
//! the unit trace to `PartialResult::assemble`, which collects every
//! artifact that did pass below the root and the feedback that led to the
//! failure.

use crate::core::{
    Artifact, ErrorBudget, ExecutionPath, Feedback, NodeId, NodeKind, StagePath, Unit, UnitState,
};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Terminal snapshot of one unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRecord {
    /// Ancestry of the unit, ending with its own id.
    pub scope: ExecutionPath,
    /// Attempt of the parent unit this unit ran under; `None` for the root.
    pub parent_attempt: Option<u32>,
    /// Kind the unit actually ran as.
    pub kind: NodeKind,
    pub unit: Unit,
    /// Stage path the unit's stage was recorded on, if it passed.
    pub path: Option<StagePath>,
    /// The validated artifact, if it passed.
    pub artifact: Option<Artifact>,
}

impl UnitRecord {
    pub fn node_id(&self) -> &NodeId {
        self.unit.node_id()
    }

    pub fn passed(&self) -> bool {
        self.unit.state() == UnitState::Passed
    }

    /// Stopped before reaching a terminal state.
    pub fn halted(&self) -> bool {
        !self.unit.is_terminal()
    }
}

/// Why a unit did not pass.
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub node_id: NodeId,
    pub scope: ExecutionPath,
    pub attempts: u32,
    pub last_feedback: String,
    pub feedback_log: Vec<Feedback>,
    /// The child failure that ended the unit's last attempt, if any.
    pub cause: Option<Box<UnitFailure>>,
    /// Stopped because a sibling exhausted, not by running out of attempts.
    pub halted: bool,
}

impl UnitFailure {
    /// Scope of the deepest unit in the failure chain.
    pub fn failed_path(&self) -> ExecutionPath {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current.scope.clone()
    }

    /// The failure chain from this unit down to the deepest cause.
    pub fn chain(&self) -> Vec<&UnitFailure> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(cause) = &current.cause {
            chain.push(cause);
            current = cause;
        }
        chain
    }

    /// One-line description used as the parent's feedback.
    pub fn summary(&self) -> String {
        if self.halted {
            format!("Sub-task '{}' was halted after {} attempt(s)", self.node_id, self.attempts)
        } else {
            format!(
                "Sub-task '{}' failed after {} attempt(s): {}",
                self.node_id, self.attempts, self.last_feedback
            )
        }
    }
}

/// A validated descendant artifact kept from a failed run.
#[derive(Debug, Clone, Serialize)]
pub struct SalvagedArtifact {
    pub scope: ExecutionPath,
    pub parent_attempt: Option<u32>,
    pub artifact: Artifact,
}

/// One feedback entry in the failure chain, with the unit it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct TrailEntry {
    pub scope: ExecutionPath,
    pub feedback: Feedback,
}

/// Best-effort result of a run whose root unit exhausted.
#[derive(Debug, Clone, Serialize)]
pub struct PartialResult {
    pub run_id: Uuid,
    pub root: NodeId,
    /// Scope of the deepest unit that exhausted.
    pub failed_path: ExecutionPath,
    pub salvaged: Vec<SalvagedArtifact>,
    /// Feedback of every unit in the failure chain, root first.
    pub feedback_trail: Vec<TrailEntry>,
    pub trace: Vec<UnitRecord>,
}

impl PartialResult {
    pub fn assemble(run_id: Uuid, failure: UnitFailure, trace: Vec<UnitRecord>) -> Self {
        let salvaged = trace
            .iter()
            .filter(|record| record.passed() && record.scope != failure.scope)
            .filter_map(|record| {
                record.artifact.clone().map(|artifact| SalvagedArtifact {
                    scope: record.scope.clone(),
                    parent_attempt: record.parent_attempt,
                    artifact,
                })
            })
            .collect();

        let feedback_trail = failure
            .chain()
            .into_iter()
            .flat_map(|f| {
                f.feedback_log.iter().map(move |feedback| TrailEntry {
                    scope: f.scope.clone(),
                    feedback: feedback.clone(),
                })
            })
            .collect();

        Self {
            run_id,
            root: failure.node_id.clone(),
            failed_path: failure.failed_path(),
            salvaged,
            feedback_trail,
            trace,
        }
    }

    /// Latest salvaged artifact for the node with this id, at any depth.
    pub fn salvaged_for(&self, id: &NodeId) -> Option<&Artifact> {
        self.salvaged
            .iter()
            .rev()
            .find(|s| s.scope.last() == Some(id))
            .map(|s| &s.artifact)
    }

    /// Composite of the most recent salvaged artifact per scope, keyed by
    /// the scope rendered as `parent/child`.
    pub fn best_effort(&self) -> Artifact {
        let mut parts = BTreeMap::new();
        for salvaged in &self.salvaged {
            parts.insert(NodeId::new(salvaged.scope.to_string()), salvaged.artifact.clone());
        }
        Artifact::Composite(parts)
    }
}

/// A run whose root unit passed.
#[derive(Debug, Clone, Serialize)]
pub struct Completion {
    pub run_id: Uuid,
    pub artifact: Artifact,
    /// Stage path of the root's stage.
    pub path: StagePath,
    pub budget: ErrorBudget,
    pub trace: Vec<UnitRecord>,
}

impl Completion {
    /// Linear error bound of the root's stage path.
    ///
    /// A structural root's validated composite is a stage of its own, so
    /// for a root over an `n`-stage chain the bound covers `n + 1` stages:
    /// the root's ε joins the sum and δ is counted `n` times.
    pub fn error_bound(&self) -> f64 {
        self.budget.bound(&self.path)
    }
}

/// What `Engine::run` returns when no fatal error occurred.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Outcome {
    Completed(Completion),
    Partial(PartialResult),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            Outcome::Completed(completion) => Some(&completion.artifact),
            Outcome::Partial(_) => None,
        }
    }

    pub fn trace(&self) -> &[UnitRecord] {
        match self {
            Outcome::Completed(completion) => &completion.trace,
            Outcome::Partial(partial) => &partial.trace,
        }
    }

    pub fn completion(self) -> Option<Completion> {
        match self {
            Outcome::Completed(completion) => Some(completion),
            Outcome::Partial(_) => None,
        }
    }

    pub fn partial(self) -> Option<PartialResult> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Partial(partial) => Some(partial),
        }
    }
}

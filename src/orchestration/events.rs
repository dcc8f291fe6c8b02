//! Lifecycle events emitted by the engine.
//!
//! Events let an observer (a CLI progress line, a test) follow a run
//! without polling. Sending never blocks the engine; a dropped receiver is
//! ignored.

use crate::core::{ExecutionPath, NodeId, NodeKind, StagePath};
use serde::Serialize;
use tokio::sync::mpsc;

/// Every event names the unit by its scope, the ancestry ending with the
/// unit's own id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum EngineEvent {
    /// A unit was created for a node.
    UnitStarted {
        scope: ExecutionPath,
        kind: NodeKind,
        depth: usize,
    },
    /// An implementation attempt is about to run.
    AttemptStarted { scope: ExecutionPath, attempt: u32 },
    /// A structural attempt produced a well-formed sub-graph.
    BlueprintAccepted {
        scope: ExecutionPath,
        attempt: u32,
        nodes: usize,
        edges: usize,
    },
    /// An attempt failed and its feedback was recorded.
    AttemptFailed {
        scope: ExecutionPath,
        attempt: u32,
        feedback: String,
    },
    /// The unit's artifact passed validation.
    UnitPassed {
        scope: ExecutionPath,
        attempts: u32,
        path: StagePath,
        object_error: f64,
        integration_error: f64,
    },
    /// Every attempt failed.
    UnitExhausted {
        scope: ExecutionPath,
        attempts: u32,
        last_feedback: String,
    },
    /// A sibling exhausted, so no further attempt was started.
    UnitHalted { scope: ExecutionPath, attempts: u32 },
}

impl EngineEvent {
    pub fn scope(&self) -> &ExecutionPath {
        match self {
            EngineEvent::UnitStarted { scope, .. }
            | EngineEvent::AttemptStarted { scope, .. }
            | EngineEvent::BlueprintAccepted { scope, .. }
            | EngineEvent::AttemptFailed { scope, .. }
            | EngineEvent::UnitPassed { scope, .. }
            | EngineEvent::UnitExhausted { scope, .. }
            | EngineEvent::UnitHalted { scope, .. } => scope,
        }
    }

    pub fn node(&self) -> Option<&NodeId> {
        self.scope().last()
    }
}

/// Sending half handed to `Engine::with_events`.
pub type EventSender = mpsc::UnboundedSender<EngineEvent>;

/// Receiving half for observers.
pub type EventReceiver = mpsc::UnboundedReceiver<EngineEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

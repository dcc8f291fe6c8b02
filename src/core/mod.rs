//! Core domain models for validated task execution.
//!
//! Nodes, contracts and graphs describe the work; units, contexts and the
//! error budget describe one execution of it.

pub mod budget;
pub mod context;
pub mod contract;
pub mod graph;
pub mod node;
pub mod unit;

pub use budget::{ErrorBudget, ExecutionPath, PathTally, StagePath};
pub use context::{Artifact, AttemptContext, DependencyArtifacts, InputContext};
pub use contract::{EdgeContract, ObjectContract, Thresholds, ValidationResult};
pub use graph::{Blueprint, EdgeSpec, TaskGraph};
pub use node::{NodeId, NodeKind, TaskNode};
pub use unit::{ErrorMetrics, Feedback, FeedbackSource, Unit, UnitState};

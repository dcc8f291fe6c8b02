pub mod config;
pub mod core;
pub mod error;
pub mod orchestration;
pub mod scripted;
pub mod telemetry;

pub use crate::core::{
    Artifact, Blueprint, EdgeSpec, ErrorBudget, ExecutionPath, InputContext, NodeId, NodeKind,
    StagePath, TaskGraph, TaskNode, Thresholds, ValidationResult,
};
pub use error::{Error, Result, TopologyError, TopologyErrorKind};
pub use orchestration::{
    Capabilities, CapabilityError, Engine, EngineConfig, Implementation, Outcome, PartialResult,
    Production, Validator,
};

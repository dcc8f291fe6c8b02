//! Orchestration layer: the capability seams, the recursive unit engine,
//! its event stream and the assembly of final or partial results.

mod assembler;
mod capability;
mod engine;
pub mod events;

pub use assembler::{
    Completion, Outcome, PartialResult, SalvagedArtifact, TrailEntry, UnitFailure, UnitRecord,
};
pub use capability::{
    Capabilities, CapabilitiesBuilder, CapabilityError, Implementation, Production, Validator,
};
pub use engine::{
    Engine, EngineConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_DEPTH, DEFAULT_MAX_RETRIES,
};
pub use events::{EngineEvent, EventReceiver, EventSender};

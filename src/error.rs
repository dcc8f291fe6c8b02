use thiserror::Error;

/// What kind of structural defect made a graph unbuildable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyErrorKind {
    /// The dependency edges form a cycle (self-loops included).
    Cycle,
    /// An edge names a node that is not part of the graph.
    DanglingEdge,
    /// Two nodes share the same id.
    DuplicateNode,
}

impl std::fmt::Display for TopologyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyErrorKind::Cycle => write!(f, "cycle"),
            TopologyErrorKind::DanglingEdge => write!(f, "dangling edge"),
            TopologyErrorKind::DuplicateNode => write!(f, "duplicate node"),
        }
    }
}

/// A graph was rejected at construction time.
///
/// Topology errors are structural: they are raised before any unit is
/// scheduled and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Topology error ({kind}): {detail}")]
pub struct TopologyError {
    pub kind: TopologyErrorKind,
    pub detail: String,
}

impl TopologyError {
    pub fn cycle(detail: impl Into<String>) -> Self {
        Self {
            kind: TopologyErrorKind::Cycle,
            detail: detail.into(),
        }
    }

    pub fn dangling_edge(detail: impl Into<String>) -> Self {
        Self {
            kind: TopologyErrorKind::DanglingEdge,
            detail: detail.into(),
        }
    }

    pub fn duplicate_node(detail: impl Into<String>) -> Self {
        Self {
            kind: TopologyErrorKind::DuplicateNode,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Node {node} uses the same instance as implementation and validator")]
    Orthogonality { node: String },

    #[error("Invalid unit transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Error bound {bound:.4} on path {path} exceeds ceiling {ceiling:.4}")]
    BudgetExceeded {
        path: String,
        bound: f64,
        ceiling: f64,
    },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;

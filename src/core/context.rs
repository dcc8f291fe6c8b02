//! Artifacts and the per-attempt input context.
//!
//! Each attempt receives a fresh `AttemptContext` built from the caller's
//! input, the validated artifacts of the node's dependencies, and the
//! feedback of every earlier failed attempt. Nothing is mutated between
//! attempts; the next attempt simply gets a new value.

use crate::core::node::NodeId;
use crate::core::unit::Feedback;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Output of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Artifact {
    /// Terminal output of a leaf (code, text, a serialized document).
    Text(String),
    /// Validated artifacts of a structural node's children.
    Composite(BTreeMap<NodeId, Artifact>),
}

impl Artifact {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Artifact::Text(s) => Some(s),
            Artifact::Composite(_) => None,
        }
    }

    /// Child artifact of a composite.
    pub fn part(&self, id: &NodeId) -> Option<&Artifact> {
        match self {
            Artifact::Composite(parts) => parts.get(id),
            Artifact::Text(_) => None,
        }
    }

    /// Flatten to text; composites wrap each part in an `<artifact>` tag.
    pub fn render(&self) -> String {
        match self {
            Artifact::Text(s) => s.clone(),
            Artifact::Composite(parts) => parts
                .iter()
                .map(|(id, part)| format!("<artifact id='{}'>\n{}\n</artifact>", id, part.render()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Validated artifacts of a node's dependencies, keyed by dependency id.
pub type DependencyArtifacts = BTreeMap<NodeId, Artifact>;

/// What the caller submits to the root unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    /// The overall goal of the run.
    pub goal: String,
    /// Free-form additional input (requirements, prior material).
    #[serde(default)]
    pub notes: String,
}

impl InputContext {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            notes: String::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }
}

/// Immutable context handed to one implementation attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub input: Arc<InputContext>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Recursion depth of the unit (the root runs at depth 0).
    pub depth: usize,
    pub dependencies: Arc<DependencyArtifacts>,
    /// Feedback from every earlier failed attempt, oldest first.
    pub feedback: Vec<Feedback>,
}

impl AttemptContext {
    pub fn new(
        input: Arc<InputContext>,
        attempt: u32,
        depth: usize,
        dependencies: Arc<DependencyArtifacts>,
        feedback: &[Feedback],
    ) -> Self {
        Self {
            input,
            attempt,
            depth,
            dependencies,
            feedback: feedback.to_vec(),
        }
    }

    pub fn goal(&self) -> &str {
        &self.input.goal
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    /// Render dependencies and feedback history for prompt-based
    /// implementations.
    pub fn render(&self) -> String {
        let mut ctx = String::new();
        if !self.input.notes.is_empty() {
            ctx.push_str(&format!("\n<notes>\n{}\n</notes>", self.input.notes));
        }
        for (id, artifact) in self.dependencies.iter() {
            ctx.push_str(&format!(
                "\n<dependency id='{}'>\n{}\n</dependency>",
                id,
                artifact.render()
            ));
        }
        if !self.feedback.is_empty() {
            ctx.push_str("\n<history>");
            for fb in &self.feedback {
                ctx.push_str(&format!("\n{}", fb));
            }
            ctx.push_str("\n</history>");
        }
        ctx
    }
}

//! Deterministic collaborators driven by a plan file.
//!
//! A plan names the root node and, per node id, what the implementation
//! returns on each attempt. `RegexValidator` reads each contract rule as a
//! regular expression: object rules over the rendered candidate, edge rules
//! over the artifact of the dependency the edge comes from.
//!
//! ```toml
//! goal = "Todo app"
//!
//! [root]
//! id = "app"
//! kind = "structural"
//! object_contract = { rule = "todos" }
//!
//! [[scripts.app.blueprints]]
//! nodes = [
//!   { id = "db", object_contract = { rule = "CREATE TABLE" } },
//!   { id = "api", object_contract = { rule = "GET /todos" } },
//! ]
//! edges = [{ from = "db", to = "api", rule = "todos" }]
//!
//! [scripts.db]
//! outputs = ["CREATE TABLE todos (id INTEGER)"]
//!
//! [scripts.api]
//! outputs = ["GET /todos reads from todos"]
//! ```
//!
//! Scripts are keyed by node id, so ids should be unique across the whole
//! plan.

use crate::core::{
    Artifact, AttemptContext, Blueprint, DependencyArtifacts, InputContext, NodeId, NodeKind,
    TaskGraph, TaskNode, Thresholds, ValidationResult,
};
use crate::error::Result;
use crate::orchestration::{CapabilityError, Implementation, Production, Validator};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// What the implementation returns for one node, per attempt. When the
/// attempt number runs past the list, the last entry is reused.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub blueprints: Vec<Blueprint>,
    /// Attempts (1-based) on which the call fails outright.
    #[serde(default)]
    pub errors: Vec<u32>,
}

impl Script {
    fn pick<T>(items: &[T], attempt: u32) -> Option<&T> {
        let index = (attempt.max(1) - 1) as usize;
        items.get(index).or_else(|| items.last())
    }
}

/// A blueprint of the plan, checked.
#[derive(Debug)]
pub struct PlannedGraph {
    pub owner: NodeId,
    /// 1-based attempt the blueprint is scripted for.
    pub attempt: usize,
    pub graph: TaskGraph,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    #[serde(default)]
    pub notes: String,
    pub root: TaskNode,
    #[serde(default)]
    pub scripts: BTreeMap<NodeId, Script>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading plan");
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn input(&self) -> InputContext {
        InputContext::new(self.goal.clone()).with_notes(self.notes.clone())
    }

    /// Give `thresholds` to every node still on the built-in default.
    pub fn apply_thresholds(&mut self, thresholds: Thresholds) {
        let default = Thresholds::default();
        let nodes = std::iter::once(&mut self.root).chain(
            self.scripts
                .values_mut()
                .flat_map(|s| s.blueprints.iter_mut())
                .flat_map(|b| b.nodes.iter_mut()),
        );
        for node in nodes {
            if node.object_contract.thresholds == default {
                node.object_contract.thresholds = thresholds;
            }
        }
    }

    /// Compile every rule and build every scripted blueprint into a graph,
    /// stopping at the first error.
    pub fn check(&self) -> Result<Vec<PlannedGraph>> {
        let blueprints = self.scripts.values().flat_map(|s| s.blueprints.iter());
        let nodes = blueprints.clone().flat_map(|b| b.nodes.iter());
        for node in std::iter::once(&self.root).chain(nodes) {
            if !node.object_contract.rule.trim().is_empty() {
                Regex::new(&node.object_contract.rule)?;
            }
        }
        for edge in blueprints.flat_map(|b| b.edges.iter()) {
            if !edge.rule.trim().is_empty() {
                Regex::new(&edge.rule)?;
            }
        }

        let mut graphs = Vec::new();
        for (owner, script) in &self.scripts {
            for (i, blueprint) in script.blueprints.iter().enumerate() {
                let graph = blueprint.clone().into_graph()?;
                graphs.push(PlannedGraph {
                    owner: owner.clone(),
                    attempt: i + 1,
                    graph,
                });
            }
        }
        Ok(graphs)
    }
}

/// Replays the productions scripted in a plan.
#[derive(Debug, Clone, Default)]
pub struct ScriptedImplementation {
    scripts: BTreeMap<NodeId, Script>,
}

impl ScriptedImplementation {
    pub fn new(scripts: BTreeMap<NodeId, Script>) -> Self {
        Self { scripts }
    }

    pub fn from_plan(plan: &Plan) -> Self {
        Self::new(plan.scripts.clone())
    }
}

#[async_trait]
impl Implementation for ScriptedImplementation {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(
        &self,
        node: &TaskNode,
        context: &AttemptContext,
    ) -> std::result::Result<Production, CapabilityError> {
        let script = self
            .scripts
            .get(&node.id)
            .ok_or_else(|| CapabilityError::new(format!("no script for node '{}'", node.id)))?;

        if script.errors.contains(&context.attempt) {
            return Err(CapabilityError::new(format!(
                "scripted failure on attempt {}",
                context.attempt
            )));
        }

        match node.kind {
            NodeKind::Leaf => Script::pick(&script.outputs, context.attempt)
                .map(|output| Production::text(output.clone()))
                .ok_or_else(|| {
                    CapabilityError::new(format!("no output scripted for node '{}'", node.id))
                }),
            NodeKind::Structural => Script::pick(&script.blueprints, context.attempt)
                .map(|blueprint| Production::Blueprint(blueprint.clone()))
                .ok_or_else(|| {
                    CapabilityError::new(format!("no blueprint scripted for node '{}'", node.id))
                }),
        }
    }
}

/// Reads every contract rule as a regular expression.
///
/// `ε` is 0 when the object rule matches the rendered candidate and 1
/// otherwise. An edge rule is matched against the validated artifact of the
/// dependency it comes from. `λ` is the fraction of incoming edges whose
/// rule does not match that artifact or whose artifact is missing. An empty
/// rule always matches.
#[derive(Debug, Clone, Default)]
pub struct RegexValidator;

impl RegexValidator {
    pub fn new() -> Self {
        Self
    }
}

fn matches(rule: &str, text: &str) -> std::result::Result<bool, CapabilityError> {
    if rule.trim().is_empty() {
        return Ok(true);
    }
    let pattern = Regex::new(rule)
        .map_err(|e| CapabilityError::new(format!("invalid rule /{}/: {}", rule, e)))?;
    Ok(pattern.is_match(text))
}

#[async_trait]
impl Validator for RegexValidator {
    fn name(&self) -> &str {
        "regex"
    }

    async fn validate(
        &self,
        node: &TaskNode,
        candidate: &Artifact,
        dependencies: &DependencyArtifacts,
    ) -> std::result::Result<ValidationResult, CapabilityError> {
        let text = candidate.render();
        let mut critique = Vec::new();

        let object_error = if matches(&node.object_contract.rule, &text)? {
            0.0
        } else {
            critique.push(format!(
                "object rule /{}/ not matched",
                node.object_contract.rule
            ));
            1.0
        };

        let mut violations = 0usize;
        for (dep, edge) in &node.edge_contracts {
            match dependencies.get(dep) {
                None => {
                    violations += 1;
                    critique.push(format!("no artifact from '{}'", dep));
                }
                Some(artifact) if !matches(&edge.rule, &artifact.render())? => {
                    violations += 1;
                    critique.push(format!(
                        "integration with '{}': /{}/ not matched by its artifact",
                        dep, edge.rule
                    ));
                }
                Some(_) => {}
            }
        }
        let integration_error = if node.edge_contracts.is_empty() {
            0.0
        } else {
            violations as f64 / node.edge_contracts.len() as f64
        };

        Ok(ValidationResult::judge(
            object_error,
            integration_error,
            node.thresholds(),
            critique.join("; "),
        ))
    }
}

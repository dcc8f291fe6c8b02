//! Capability seams: the implementation that produces candidates and the
//! validator that judges them.
//!
//! Both are opaque to the engine. It only requires that, for any node, the
//! implementation and the validator are distinct instances.

use crate::core::{
    Artifact, AttemptContext, Blueprint, DependencyArtifacts, NodeId, NodeKind, TaskNode,
    ValidationResult,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Failure of a capability call. The engine turns it into feedback for the
/// next attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for CapabilityError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for CapabilityError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What an implementation call returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Production {
    /// Terminal output of a leaf.
    Artifact(Artifact),
    /// Decomposition of a structural node.
    Blueprint(Blueprint),
}

impl Production {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Artifact(Artifact::text(content))
    }

    /// The node kind this production is valid for.
    pub fn kind(&self) -> NodeKind {
        match self {
            Production::Artifact(_) => NodeKind::Leaf,
            Production::Blueprint(_) => NodeKind::Structural,
        }
    }
}

/// Produces a candidate for one attempt of a node.
///
/// Leaves must return `Production::Artifact`, structural nodes
/// `Production::Blueprint`.
#[async_trait]
pub trait Implementation: Send + Sync {
    fn name(&self) -> &str {
        "implementation"
    }

    async fn execute(
        &self,
        node: &TaskNode,
        context: &AttemptContext,
    ) -> std::result::Result<Production, CapabilityError>;
}

/// Judges a candidate against the node's object contract and, using the
/// dependency artifacts, against its incoming edge contracts.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str {
        "validator"
    }

    async fn validate(
        &self,
        node: &TaskNode,
        candidate: &Artifact,
        dependencies: &DependencyArtifacts,
    ) -> std::result::Result<ValidationResult, CapabilityError>;
}

/// Implementations and validators the engine may use, with optional
/// per-node overrides.
///
/// Overrides are keyed by node id and apply at every depth where that id
/// appears.
#[derive(Clone)]
pub struct Capabilities {
    leaf: Arc<dyn Implementation>,
    structural: Arc<dyn Implementation>,
    validator: Arc<dyn Validator>,
    implementations: HashMap<NodeId, Arc<dyn Implementation>>,
    validators: HashMap<NodeId, Arc<dyn Validator>>,
}

impl Capabilities {
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }

    /// Implementation and validator for `node`.
    pub fn resolve(&self, node: &TaskNode) -> Result<(Arc<dyn Implementation>, Arc<dyn Validator>)> {
        let implementation = match self.implementations.get(&node.id) {
            Some(implementation) => implementation.clone(),
            None => match node.kind {
                NodeKind::Leaf => self.leaf.clone(),
                NodeKind::Structural => self.structural.clone(),
            },
        };
        let validator = self
            .validators
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| self.validator.clone());

        if same_instance(&implementation, &validator) {
            return Err(Error::Orthogonality {
                node: node.id.to_string(),
            });
        }
        Ok((implementation, validator))
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("leaf", &self.leaf.name())
            .field("structural", &self.structural.name())
            .field("validator", &self.validator.name())
            .field("implementation_overrides", &self.implementations.len())
            .field("validator_overrides", &self.validators.len())
            .finish()
    }
}

#[derive(Default)]
pub struct CapabilitiesBuilder {
    leaf: Option<Arc<dyn Implementation>>,
    structural: Option<Arc<dyn Implementation>>,
    validator: Option<Arc<dyn Validator>>,
    implementations: HashMap<NodeId, Arc<dyn Implementation>>,
    validators: HashMap<NodeId, Arc<dyn Validator>>,
}

impl CapabilitiesBuilder {
    /// Use `implementation` for both leaves and structural nodes.
    pub fn implementation(mut self, implementation: Arc<dyn Implementation>) -> Self {
        self.leaf = Some(implementation.clone());
        self.structural = Some(implementation);
        self
    }

    pub fn leaf_implementation(mut self, implementation: Arc<dyn Implementation>) -> Self {
        self.leaf = Some(implementation);
        self
    }

    pub fn structural_implementation(mut self, implementation: Arc<dyn Implementation>) -> Self {
        self.structural = Some(implementation);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn implementation_for(
        mut self,
        id: impl Into<NodeId>,
        implementation: Arc<dyn Implementation>,
    ) -> Self {
        self.implementations.insert(id.into(), implementation);
        self
    }

    pub fn validator_for(mut self, id: impl Into<NodeId>, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(id.into(), validator);
        self
    }

    /// Check that every pairing the engine can resolve uses two distinct
    /// instances.
    pub fn build(self) -> Result<Capabilities> {
        let leaf = self
            .leaf
            .ok_or_else(|| Error::Config("no leaf implementation configured".to_string()))?;
        let structural = self
            .structural
            .ok_or_else(|| Error::Config("no structural implementation configured".to_string()))?;
        let validator = self
            .validator
            .ok_or_else(|| Error::Config("no validator configured".to_string()))?;

        for default in [&leaf, &structural] {
            if same_instance(default, &validator) {
                return Err(Error::Orthogonality {
                    node: "*".to_string(),
                });
            }
        }
        for (id, implementation) in &self.implementations {
            let paired = self.validators.get(id).unwrap_or(&validator);
            if same_instance(implementation, paired) {
                return Err(Error::Orthogonality {
                    node: id.to_string(),
                });
            }
        }
        for (id, override_validator) in &self.validators {
            if self.implementations.contains_key(id) {
                continue;
            }
            if same_instance(&leaf, override_validator) || same_instance(&structural, override_validator) {
                return Err(Error::Orthogonality {
                    node: id.to_string(),
                });
            }
        }

        Ok(Capabilities {
            leaf,
            structural,
            validator,
            implementations: self.implementations,
            validators: self.validators,
        })
    }
}

/// True when both trait objects point at the same allocation.
fn same_instance(implementation: &Arc<dyn Implementation>, validator: &Arc<dyn Validator>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(implementation) as *const u8,
        Arc::as_ptr(validator) as *const u8,
    )
}

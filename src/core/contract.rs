//! Contracts and the two-metric validation result.
//!
//! A node carries one object contract (what its own output must satisfy)
//! and one edge contract per incoming dependency (how it must use that
//! dependency's output). Validators score a candidate against both and the
//! engine applies the pass policy from the node's thresholds.

use serde::{Deserialize, Serialize};

/// Default limit for both the object and the integration error.
pub const DEFAULT_THRESHOLD: f64 = 0.15;

/// Pass thresholds for a node's contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Maximum tolerated object error (ε).
    #[serde(default = "default_threshold")]
    pub epsilon: f64,
    /// Maximum tolerated integration error (λ).
    #[serde(default = "default_threshold")]
    pub lambda: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            epsilon: DEFAULT_THRESHOLD,
            lambda: DEFAULT_THRESHOLD,
        }
    }
}

impl Thresholds {
    pub fn new(epsilon: f64, lambda: f64) -> Self {
        Self { epsilon, lambda }
    }

    /// Both errors are within limits.
    pub fn admits(&self, object_error: f64, integration_error: f64) -> bool {
        object_error <= self.epsilon && integration_error <= self.lambda
    }
}

/// Predicate the node's own output must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectContract {
    /// Human or machine readable rule (a schema, a regex, a prose spec).
    pub rule: String,
    #[serde(default)]
    pub thresholds: Thresholds,
}

impl ObjectContract {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            thresholds: Thresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

/// Integration predicate checked against one dependency's validated output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeContract {
    pub rule: String,
}

impl EdgeContract {
    pub fn new(rule: impl Into<String>) -> Self {
        Self { rule: rule.into() }
    }
}

/// Outcome of validating one candidate artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    /// Distance of the artifact from its own contract, in `[0, 1]`.
    pub object_error: f64,
    /// Distance of the artifact's use of its dependencies from the edge
    /// contracts, in `[0, 1]`.
    pub integration_error: f64,
    /// Explanation; always non-empty when `passed` is false.
    pub feedback: String,
}

impl ValidationResult {
    /// Build a result whose verdict follows the thresholds.
    pub fn judge(
        object_error: f64,
        integration_error: f64,
        thresholds: &Thresholds,
        feedback: impl Into<String>,
    ) -> Self {
        Self {
            passed: true,
            object_error,
            integration_error,
            feedback: feedback.into(),
        }
        .enforce(thresholds)
    }

    /// A failed result with maximal errors, used when the validator itself
    /// could not produce a verdict.
    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            object_error: 1.0,
            integration_error: 1.0,
            feedback: feedback.into(),
        }
        .enforce(&Thresholds::default())
    }

    /// Apply the pass policy: clamp both errors to `[0, 1]` (NaN counts as
    /// 1.0) and pass only if the validator said so and both errors are
    /// within the thresholds. A failing result always carries feedback.
    pub fn enforce(mut self, thresholds: &Thresholds) -> Self {
        self.object_error = clamp_unit(self.object_error);
        self.integration_error = clamp_unit(self.integration_error);
        self.passed = self.passed && thresholds.admits(self.object_error, self.integration_error);

        if !self.passed && self.feedback.trim().is_empty() {
            self.feedback = format!(
                "Rejected without critique (object error {:.2}, integration error {:.2})",
                self.object_error, self.integration_error
            );
        }
        self
    }

    pub fn metrics(&self) -> (f64, f64) {
        (self.object_error, self.integration_error)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        1.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

//! Runtime state of one node execution.
//!
//! A `Unit` owns the attempt counter and the feedback log of a single node
//! for the duration of one run, and enforces the attempt state machine:
//!
//! ```text
//! Pending -> Executing -> Validating -> Passed
//!               |             |
//!               +--> Failed <-+
//!                      |
//!                      +--> Executing   (attempt < max_retries)
//!                      +--> Exhausted   (attempt == max_retries)
//! ```

use crate::core::node::NodeId;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a unit in its attempt state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UnitState {
    Pending,
    Executing,
    Validating,
    Passed,
    /// The given attempt (1-based) failed.
    Failed { attempt: u32 },
    /// Every attempt failed.
    Exhausted,
}

impl Default for UnitState {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Executing => write!(f, "executing"),
            UnitState::Validating => write!(f, "validating"),
            UnitState::Passed => write!(f, "passed"),
            UnitState::Failed { attempt } => write!(f, "failed[{}]", attempt),
            UnitState::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Where a feedback entry came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum FeedbackSource {
    /// The validator rejected the candidate.
    Validator {
        object_error: f64,
        integration_error: f64,
    },
    /// The implementation call itself failed.
    Implementation,
    /// The produced blueprint could not be turned into a graph.
    Blueprint,
    /// A child unit of the produced sub-graph exhausted its attempts.
    Child { node: NodeId },
}

impl std::fmt::Display for FeedbackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackSource::Validator { .. } => write!(f, "validator"),
            FeedbackSource::Implementation => write!(f, "implementation"),
            FeedbackSource::Blueprint => write!(f, "blueprint"),
            FeedbackSource::Child { node } => write!(f, "child {}", node),
        }
    }
}

/// One entry of a unit's feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// The attempt that produced this feedback.
    pub attempt: u32,
    pub source: FeedbackSource,
    pub message: String,
}

impl Feedback {
    pub fn new(attempt: u32, source: FeedbackSource, message: impl Into<String>) -> Self {
        Self {
            attempt,
            source,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[attempt {}] {}: {}", self.attempt, self.source, self.message)
    }
}

/// Last recorded validation metrics of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    /// Object error ε.
    pub object_error: f64,
    /// Integration error λ.
    pub integration_error: f64,
}

/// The runtime instance bound to one node during one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    node_id: NodeId,
    max_retries: u32,
    attempt: u32,
    state: UnitState,
    feedback_log: Vec<Feedback>,
    error_metrics: Option<ErrorMetrics>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Unit {
    /// Create a pending unit allowed `max_retries` attempts in total.
    pub fn new(node_id: NodeId, max_retries: u32) -> Self {
        Self {
            node_id,
            max_retries,
            attempt: 0,
            state: UnitState::Pending,
            feedback_log: Vec::new(),
            error_metrics: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn feedback_log(&self) -> &[Feedback] {
        &self.feedback_log
    }

    pub fn last_feedback(&self) -> Option<&Feedback> {
        self.feedback_log.last()
    }

    pub fn error_metrics(&self) -> Option<ErrorMetrics> {
        self.error_metrics
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Another attempt may be scheduled.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Passed or Exhausted.
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, UnitState::Passed | UnitState::Exhausted)
    }

    fn invalid(&self, to: &str) -> Error {
        Error::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    /// Start the next attempt. Returns its 1-based number.
    ///
    /// Allowed from `Pending`, or from `Failed` while attempts remain.
    pub fn schedule(&mut self) -> Result<u32> {
        match self.state {
            UnitState::Pending if self.max_retries > 0 => {
                self.started_at = Some(Utc::now());
            }
            UnitState::Failed { .. } if self.can_retry() => {}
            _ => return Err(self.invalid("executing")),
        }
        self.attempt += 1;
        self.state = UnitState::Executing;
        Ok(self.attempt)
    }

    /// The implementation returned a candidate.
    pub fn begin_validation(&mut self) -> Result<()> {
        if self.state != UnitState::Executing {
            return Err(self.invalid("validating"));
        }
        self.state = UnitState::Validating;
        Ok(())
    }

    /// Record validation metrics, whatever the verdict.
    pub fn record_metrics(&mut self, object_error: f64, integration_error: f64) {
        self.error_metrics = Some(ErrorMetrics {
            object_error,
            integration_error,
        });
    }

    /// The validator accepted the candidate.
    pub fn pass(&mut self) -> Result<()> {
        if self.state != UnitState::Validating {
            return Err(self.invalid("passed"));
        }
        self.state = UnitState::Passed;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// The current attempt failed; its feedback is appended to the log.
    pub fn fail(&mut self, source: FeedbackSource, message: impl Into<String>) -> Result<()> {
        if !matches!(self.state, UnitState::Executing | UnitState::Validating) {
            return Err(self.invalid("failed"));
        }
        self.feedback_log
            .push(Feedback::new(self.attempt, source, message));
        self.state = UnitState::Failed {
            attempt: self.attempt,
        };
        Ok(())
    }

    /// Every attempt has been spent.
    pub fn exhaust(&mut self) -> Result<()> {
        match self.state {
            UnitState::Failed { attempt } if attempt == self.max_retries => {
                self.state = UnitState::Exhausted;
                self.finished_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(self.invalid("exhausted")),
        }
    }
}

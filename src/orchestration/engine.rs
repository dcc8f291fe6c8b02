//! Unit execution engine.
//!
//! The engine drives one unit through its attempts: build a fresh context,
//! call the implementation, validate the candidate, and on failure append
//! the feedback and try again until the retry limit. A structural node's
//! implementation returns a blueprint; the engine checks it, runs the
//! resulting sub-graph group by group with one unit per child, and
//! validates the composite of the children's artifacts as the parent's
//! candidate.
//!
//! Children of one independent group run concurrently, bounded by
//! `max_concurrency`. When one of them exhausts, its siblings finish the
//! attempt they are in but start no new one.

use crate::core::{
    Artifact, AttemptContext, DependencyArtifacts, ErrorBudget, ExecutionPath, FeedbackSource,
    InputContext, NodeId, NodeKind, StagePath, TaskGraph, TaskNode, Unit, ValidationResult,
};
use crate::error::{Error, Result};
use crate::orchestration::assembler::{
    Completion, Outcome, PartialResult, UnitFailure, UnitRecord,
};
use crate::orchestration::capability::{Capabilities, Implementation, Production, Validator};
use crate::orchestration::events::{EngineEvent, EventSender};
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default number of attempts per unit.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default recursion depth at which structural nodes run as leaves.
pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Default number of sibling units running at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Engine parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Total attempts allowed per unit.
    pub max_retries: u32,
    /// Structural nodes at this depth or deeper run as leaves.
    pub max_depth: usize,
    /// Maximum concurrently running units within one independent group.
    pub max_concurrency: usize,
    /// Composition discrepancy δ recorded with every stage.
    pub composition_discrepancy: f64,
    /// Abort the run once a path's bound exceeds this value.
    pub error_ceiling: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_depth: DEFAULT_MAX_DEPTH,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            composition_discrepancy: 0.0,
            error_ceiling: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if !self.composition_discrepancy.is_finite() || self.composition_discrepancy < 0.0 {
            return Err(Error::Config(format!(
                "composition_discrepancy must be a non-negative number, got {}",
                self.composition_discrepancy
            )));
        }
        if let Some(ceiling) = self.error_ceiling {
            if !ceiling.is_finite() || ceiling < 0.0 {
                return Err(Error::Config(format!(
                    "error_ceiling must be a non-negative number, got {}",
                    ceiling
                )));
            }
        }
        Ok(())
    }
}

/// Where a unit runs: its ancestry, its inputs and its slice of the budget.
#[derive(Clone)]
struct Frame {
    input: Arc<InputContext>,
    depth: usize,
    parent_scope: ExecutionPath,
    parent_attempt: Option<u32>,
    /// Stage path the unit's stage extends.
    incoming: StagePath,
    /// Fork of the parent's budget on `incoming`.
    budget: ErrorBudget,
    dependencies: Arc<DependencyArtifacts>,
    /// Cancelled when a sibling exhausts.
    halt: CancellationToken,
}

/// A candidate awaiting validation, with the path and budget it would be
/// recorded on.
struct Candidate {
    artifact: Artifact,
    base: StagePath,
    budget: ErrorBudget,
}

struct Passed {
    artifact: Artifact,
    path: StagePath,
    budget: ErrorBudget,
}

struct UnitRun {
    result: std::result::Result<Passed, UnitFailure>,
    trace: Vec<UnitRecord>,
}

struct GraphRun {
    result: std::result::Result<Candidate, UnitFailure>,
    trace: Vec<UnitRecord>,
}

enum AttemptResult {
    Passed(Passed),
    /// The attempt's feedback is already in the unit's log. `cause` is set
    /// when a child unit ended the attempt.
    Failed { cause: Option<UnitFailure> },
}

/// Runs task nodes to a validated artifact or a partial result.
pub struct Engine {
    config: EngineConfig,
    capabilities: Capabilities,
    events: Option<EventSender>,
}

impl Engine {
    pub fn new(config: EngineConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            capabilities,
            events: None,
        })
    }

    /// Send lifecycle events to `sender`.
    pub fn with_events(mut self, sender: EventSender) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `root` against `input`.
    ///
    /// Returns `Outcome::Completed` when the root passes and
    /// `Outcome::Partial` when it exhausts. Errors are reserved for runs
    /// that cannot continue: an implementation paired with itself as
    /// validator, or a path bound above the configured ceiling.
    pub async fn run(&self, root: TaskNode, input: InputContext) -> Result<Outcome> {
        let run_id = Uuid::new_v4();
        info!(run = %run_id, root = %root.id, kind = %root.kind, "Starting run");

        let frame = Frame {
            input: Arc::new(input),
            depth: 0,
            parent_scope: ExecutionPath::root(),
            parent_attempt: None,
            incoming: StagePath::root(),
            budget: ErrorBudget::new(),
            dependencies: Arc::new(DependencyArtifacts::new()),
            halt: CancellationToken::new(),
        };
        let run = self.run_unit(root, frame).await?;

        match run.result {
            Ok(passed) => {
                info!(
                    run = %run_id,
                    path = %passed.path,
                    bound = passed.budget.bound(&passed.path),
                    "Run completed"
                );
                Ok(Outcome::Completed(Completion {
                    run_id,
                    artifact: passed.artifact,
                    path: passed.path,
                    budget: passed.budget,
                    trace: run.trace,
                }))
            }
            Err(failure) => {
                warn!(
                    run = %run_id,
                    failed_path = %failure.failed_path(),
                    "Run ended with a partial result"
                );
                Ok(Outcome::Partial(PartialResult::assemble(
                    run_id, failure, run.trace,
                )))
            }
        }
    }

    fn emit(&self, event: EngineEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }

    fn run_unit<'a>(&'a self, node: TaskNode, frame: Frame) -> BoxFuture<'a, Result<UnitRun>> {
        async move {
            let node = if node.is_structural() && frame.depth >= self.config.max_depth {
                debug!(
                    node = %node.id,
                    depth = frame.depth,
                    "Depth limit reached, running structural node as a leaf"
                );
                node.as_leaf()
            } else {
                node
            };
            let scope = frame.parent_scope.extend(&node.id);
            let (implementation, validator) = self.capabilities.resolve(&node)?;
            let mut unit = Unit::new(node.id.clone(), self.config.max_retries);
            let mut trace = Vec::new();
            let mut last_cause = None;

            self.emit(EngineEvent::UnitStarted {
                scope: scope.clone(),
                kind: node.kind,
                depth: frame.depth,
            });
            debug!(node = %node.id, contract = %node.contract_text(), "Unit contract");

            loop {
                if frame.halt.is_cancelled() {
                    return Ok(self.halt(&node, unit, scope, &frame, last_cause, trace));
                }

                let attempt = unit.schedule()?;
                self.emit(EngineEvent::AttemptStarted {
                    scope: scope.clone(),
                    attempt,
                });
                info!(
                    node = %node.id,
                    attempt,
                    max = self.config.max_retries,
                    depth = frame.depth,
                    kind = %node.kind,
                    "Executing unit"
                );

                let result = self
                    .attempt(
                        &node,
                        &mut unit,
                        &frame,
                        &scope,
                        implementation.as_ref(),
                        validator.as_ref(),
                        &mut trace,
                    )
                    .await?;

                let cause = match result {
                    AttemptResult::Passed(passed) => {
                        let metrics = unit.error_metrics();
                        self.emit(EngineEvent::UnitPassed {
                            scope: scope.clone(),
                            attempts: attempt,
                            path: passed.path.clone(),
                            object_error: metrics.map(|m| m.object_error).unwrap_or(0.0),
                            integration_error: metrics.map(|m| m.integration_error).unwrap_or(0.0),
                        });
                        trace.push(UnitRecord {
                            scope,
                            parent_attempt: frame.parent_attempt,
                            kind: node.kind,
                            unit,
                            path: Some(passed.path.clone()),
                            artifact: Some(passed.artifact.clone()),
                        });
                        return Ok(UnitRun {
                            result: Ok(passed),
                            trace,
                        });
                    }
                    AttemptResult::Failed { cause } => cause,
                };

                let last_feedback = unit
                    .last_feedback()
                    .map(|f| f.message.clone())
                    .unwrap_or_default();
                self.emit(EngineEvent::AttemptFailed {
                    scope: scope.clone(),
                    attempt,
                    feedback: last_feedback.clone(),
                });

                if !unit.can_retry() {
                    unit.exhaust()?;
                    error!(
                        node = %node.id,
                        attempts = unit.attempt(),
                        feedback = %last_feedback,
                        "Unit exhausted its attempts"
                    );
                    self.emit(EngineEvent::UnitExhausted {
                        scope: scope.clone(),
                        attempts: unit.attempt(),
                        last_feedback: last_feedback.clone(),
                    });
                    let failure = UnitFailure {
                        node_id: node.id.clone(),
                        scope: scope.clone(),
                        attempts: unit.attempt(),
                        last_feedback,
                        feedback_log: unit.feedback_log().to_vec(),
                        cause: cause.map(Box::new),
                        halted: false,
                    };
                    trace.push(UnitRecord {
                        scope,
                        parent_attempt: frame.parent_attempt,
                        kind: node.kind,
                        unit,
                        path: None,
                        artifact: None,
                    });
                    return Ok(UnitRun {
                        result: Err(failure),
                        trace,
                    });
                }
                last_cause = cause;
            }
        }
        .boxed()
    }

    /// One attempt: produce a candidate, validate it, record the stage on
    /// success.
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        node: &TaskNode,
        unit: &mut Unit,
        frame: &Frame,
        scope: &ExecutionPath,
        implementation: &dyn Implementation,
        validator: &dyn Validator,
        trace: &mut Vec<UnitRecord>,
    ) -> Result<AttemptResult> {
        let attempt = unit.attempt();
        let context = AttemptContext::new(
            frame.input.clone(),
            attempt,
            frame.depth,
            frame.dependencies.clone(),
            unit.feedback_log(),
        );

        let production = match implementation.execute(node, &context).await {
            Ok(production) => production,
            Err(e) => {
                warn!(node = %node.id, attempt, error = %e, "Implementation call failed");
                unit.fail(
                    FeedbackSource::Implementation,
                    format!("Implementation error: {}", e),
                )?;
                return Ok(AttemptResult::Failed { cause: None });
            }
        };

        let candidate = match (node.kind, production) {
            (NodeKind::Leaf, Production::Artifact(artifact)) => {
                debug!(node = %node.id, attempt, artifact = %artifact, "Candidate produced");
                Candidate {
                    artifact,
                    base: frame.incoming.clone(),
                    budget: frame.budget.clone(),
                }
            }
            (NodeKind::Structural, Production::Blueprint(blueprint)) => {
                let (nodes, edges) = (blueprint.nodes.len(), blueprint.edges.len());
                let graph = match blueprint.into_graph() {
                    Ok(graph) => graph,
                    Err(e) => {
                        warn!(node = %node.id, attempt, error = %e, "Blueprint rejected");
                        unit.fail(FeedbackSource::Blueprint, e.to_string())?;
                        return Ok(AttemptResult::Failed { cause: None });
                    }
                };
                self.emit(EngineEvent::BlueprintAccepted {
                    scope: scope.clone(),
                    attempt,
                    nodes,
                    edges,
                });
                info!(node = %node.id, attempt, nodes, edges, "Blueprint accepted");

                let sub = self.run_graph(graph, frame, scope, attempt).await?;
                trace.extend(sub.trace);
                match sub.result {
                    Ok(candidate) => candidate,
                    Err(child) => {
                        unit.fail(
                            FeedbackSource::Child {
                                node: child.node_id.clone(),
                            },
                            child.summary(),
                        )?;
                        return Ok(AttemptResult::Failed { cause: Some(child) });
                    }
                }
            }
            (kind, production) => {
                let message = format!(
                    "A {} node must produce {}, got {}",
                    kind,
                    describe(kind),
                    describe(production.kind())
                );
                warn!(node = %node.id, attempt, "{}", message);
                unit.fail(FeedbackSource::Implementation, message)?;
                return Ok(AttemptResult::Failed { cause: None });
            }
        };

        unit.begin_validation()?;
        let result = match validator
            .validate(node, &candidate.artifact, &frame.dependencies)
            .await
        {
            Ok(result) => result.enforce(node.thresholds()),
            Err(e) => {
                warn!(node = %node.id, attempt, error = %e, "Validator call failed");
                ValidationResult::rejected(format!("Validator error: {}", e))
            }
        };
        unit.record_metrics(result.object_error, result.integration_error);

        if !result.passed {
            info!(
                node = %node.id,
                attempt,
                epsilon = result.object_error,
                lambda = result.integration_error,
                feedback = %result.feedback,
                "Candidate rejected"
            );
            unit.fail(
                FeedbackSource::Validator {
                    object_error: result.object_error,
                    integration_error: result.integration_error,
                },
                result.feedback,
            )?;
            return Ok(AttemptResult::Failed { cause: None });
        }

        unit.pass()?;
        let path = candidate.base.then(scope);
        let mut budget = candidate.budget;
        budget.record(&path, result.object_error, self.config.composition_discrepancy);
        let bound = budget.bound(&path);
        info!(
            node = %node.id,
            attempt,
            epsilon = result.object_error,
            lambda = result.integration_error,
            path = %path,
            bound,
            "Candidate passed"
        );

        if let Some(ceiling) = self.config.error_ceiling {
            if bound > ceiling {
                error!(path = %path, bound, ceiling, "Error bound exceeds ceiling");
                return Err(Error::BudgetExceeded {
                    path: path.to_string(),
                    bound,
                    ceiling,
                });
            }
        }

        Ok(AttemptResult::Passed(Passed {
            artifact: candidate.artifact,
            path,
            budget,
        }))
    }

    /// Run a sub-graph group by group and compose the children's
    /// artifacts into the parent's candidate.
    async fn run_graph(
        &self,
        graph: TaskGraph,
        frame: &Frame,
        scope: &ExecutionPath,
        attempt: u32,
    ) -> Result<GraphRun> {
        let mut budget = frame.budget.clone();
        let mut passed: BTreeMap<NodeId, Passed> = BTreeMap::new();
        let mut trace = Vec::new();

        for group in graph.independent_groups() {
            debug!(parent = %scope, attempt, group = ?group, "Launching independent group");
            let halt = frame.halt.child_token();

            let mut launches = Vec::with_capacity(group.len());
            for id in &group {
                let Some(child) = graph.node(id).cloned() else {
                    continue;
                };
                let deps = graph.dependencies(id);
                let dependencies: DependencyArtifacts = deps
                    .iter()
                    .filter_map(|dep| {
                        passed
                            .get(*dep)
                            .map(|p| ((*dep).clone(), p.artifact.clone()))
                    })
                    .collect();
                let incoming = budget
                    .worst_of(deps.iter().filter_map(|dep| passed.get(*dep).map(|p| &p.path)))
                    .cloned()
                    .unwrap_or_else(|| frame.incoming.clone());

                launches.push((
                    child,
                    Frame {
                        input: frame.input.clone(),
                        depth: frame.depth + 1,
                        parent_scope: scope.clone(),
                        parent_attempt: Some(attempt),
                        budget: budget.fork(&incoming),
                        incoming,
                        dependencies: Arc::new(dependencies),
                        halt: halt.clone(),
                    },
                ));
            }

            let mut runs: Vec<(usize, NodeId, Result<UnitRun>)> =
                stream::iter(launches.into_iter().enumerate())
                    .map(move |(position, (child, child_frame))| {
                        let halt = halt.clone();
                        async move {
                            let id = child.id.clone();
                            let run = self.run_unit(child, child_frame).await;
                            let failed = match &run {
                                Ok(run) => run.result.is_err(),
                                Err(_) => true,
                            };
                            if failed {
                                halt.cancel();
                            }
                            (position, id, run)
                        }
                    })
                    .buffer_unordered(self.config.max_concurrency)
                    .collect()
                    .await;
            runs.sort_by_key(|(position, _, _)| *position);

            let mut failures = Vec::new();
            for (_, id, run) in runs {
                let run = run?;
                trace.extend(run.trace);
                match run.result {
                    Ok(child) => {
                        budget.merge(child.budget.clone());
                        passed.insert(id, child);
                    }
                    Err(failure) => failures.push(failure),
                }
            }

            if !failures.is_empty() {
                let index = failures.iter().position(|f| !f.halted).unwrap_or(0);
                return Ok(GraphRun {
                    result: Err(failures.swap_remove(index)),
                    trace,
                });
            }
        }

        let base = budget
            .worst_of(passed.values().map(|p| &p.path))
            .cloned()
            .unwrap_or_else(|| frame.incoming.clone());
        let artifact = Artifact::Composite(
            passed
                .into_iter()
                .map(|(id, child)| (id, child.artifact))
                .collect(),
        );

        Ok(GraphRun {
            result: Ok(Candidate {
                artifact,
                base,
                budget,
            }),
            trace,
        })
    }

    fn halt(
        &self,
        node: &TaskNode,
        unit: Unit,
        scope: ExecutionPath,
        frame: &Frame,
        cause: Option<UnitFailure>,
        mut trace: Vec<UnitRecord>,
    ) -> UnitRun {
        info!(node = %node.id, attempts = unit.attempt(), "Unit halted");
        self.emit(EngineEvent::UnitHalted {
            scope: scope.clone(),
            attempts: unit.attempt(),
        });

        let failure = UnitFailure {
            node_id: node.id.clone(),
            scope: scope.clone(),
            attempts: unit.attempt(),
            last_feedback: unit
                .last_feedback()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "halted before its first attempt".to_string()),
            feedback_log: unit.feedback_log().to_vec(),
            cause: cause.map(Box::new),
            halted: true,
        };
        if unit.attempt() > 0 {
            trace.push(UnitRecord {
                scope,
                parent_attempt: frame.parent_attempt,
                kind: node.kind,
                unit,
                path: None,
                artifact: None,
            });
        }
        UnitRun {
            result: Err(failure),
            trace,
        }
    }
}

fn describe(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::Leaf => "an artifact",
        NodeKind::Structural => "a blueprint",
    }
}

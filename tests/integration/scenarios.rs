//! End-to-end scenarios for the recursive engine.
//!
//! Each test wires the mock implementation and validator into an engine,
//! runs a root node and checks the outcome, the trace and what the
//! collaborators observed.

use std::sync::Arc;

use validag::core::{ErrorMetrics, FeedbackSource, UnitState};
use validag::orchestration::{
    Capabilities, CapabilityError, EngineConfig, EngineEvent, Implementation, Production,
    Validator,
};
use validag::{
    Artifact, Blueprint, EdgeSpec, Error, ExecutionPath, InputContext, NodeId, NodeKind, StagePath,
    TaskGraph, TaskNode, TopologyErrorKind, ValidationResult,
};

use crate::fixtures::{
    leaf, linear_blueprint, structural, text, EngineHarness, MockImplementation, MockValidator,
    Step,
};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn input() -> InputContext {
    InputContext::new("Build a todo app")
}

/// Scenario A: db -> api -> ui all pass on their first attempt.
#[tokio::test]
async fn test_linear_graph_passes_with_summed_bound() {
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(linear_blueprint())])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos from todos")])
        .script("ui", vec![text("<TodoList src='/todos'/>")]);
    let validator = MockValidator::new()
        .score("db", 0.01)
        .score("api", 0.02)
        .score("ui", 0.04);
    let harness = EngineHarness::new(implementation, validator, EngineConfig::default());

    let completion = harness
        .engine
        .run(structural("app", "CREATE TABLE"), input())
        .await
        .unwrap()
        .completion()
        .expect("root should pass");

    let chain = StagePath::from_scopes(&["app/db", "app/api", "app/ui"]);
    assert!(approx(completion.budget.bound(&chain), 0.07));
    assert_eq!(completion.budget.stages(&chain), 3);
    assert_eq!(
        completion.path,
        StagePath::from_scopes(&["app/db", "app/api", "app/ui", "app"])
    );
    // The root's composite is a fourth stage, validated at ε = 0.
    assert!(approx(completion.error_bound(), 0.07));

    assert_eq!(
        completion.artifact.part(&"api".into()),
        Some(&Artifact::text("GET /todos from todos"))
    );
    for record in &completion.trace {
        assert_eq!(record.unit.state(), UnitState::Passed);
        assert_eq!(record.unit.attempt(), 1);
    }
    assert_eq!(completion.trace.len(), 4);
    assert_eq!(completion.trace.last().unwrap().node_id(), &NodeId::from("app"));
}

#[tokio::test]
async fn test_discrepancy_adds_per_composition_step() {
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(linear_blueprint())])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos from todos")])
        .script("ui", vec![text("<TodoList src='/todos'/>")]);
    let validator = MockValidator::new()
        .score("db", 0.01)
        .score("api", 0.02)
        .score("ui", 0.04);
    let config = EngineConfig {
        composition_discrepancy: 0.01,
        ..Default::default()
    };
    let harness = EngineHarness::new(implementation, validator, config);

    let completion = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap()
        .completion()
        .unwrap();

    let chain = StagePath::from_scopes(&["app/db", "app/api", "app/ui"]);
    assert!(approx(completion.budget.bound(&chain), 0.07 + 0.02));
    // The root's stage adds a third join: 0.07 + 0 + 0.01 * 3.
    assert_eq!(completion.budget.stages(&completion.path), 4);
    assert!(approx(completion.error_bound(), 0.07 + 0.03));
}

/// Scenario B: a leaf fails twice, then passes on its last attempt.
#[tokio::test]
async fn test_leaf_passes_on_final_attempt() {
    let implementation = MockImplementation::new().script(
        "db",
        vec![text("CREATE TABL"), text("DROP"), text("CREATE TABLE todos")],
    );
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let completion = harness
        .engine
        .run(leaf("db", "CREATE TABLE"), input())
        .await
        .unwrap()
        .completion()
        .unwrap();

    let record = &completion.trace[0];
    assert_eq!(record.unit.state(), UnitState::Passed);
    assert_eq!(record.unit.attempt(), 3);
    assert_eq!(record.unit.feedback_log().len(), 2);
    assert_eq!(
        record.unit.error_metrics(),
        Some(ErrorMetrics {
            object_error: 0.0,
            integration_error: 0.0
        })
    );

    let seen: Vec<usize> = implementation
        .calls_for("db")
        .iter()
        .map(|c| c.feedback.len())
        .collect();
    assert_eq!(seen, vec![0, 1, 2]);
}

/// Scenario C: a child exhausts and its parent replans.
#[tokio::test]
async fn test_child_exhaustion_triggers_replanning() {
    let first = Blueprint::new()
        .node(leaf("db", "CREATE TABLE"))
        .node(leaf("api", "GET /todos"))
        .edge("db", "api", "todos");
    let second = Blueprint::new()
        .node(leaf("db", "CREATE TABLE"))
        .node(leaf("rest", "GET /todos"))
        .edge("db", "rest", "todos");

    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(first), Step::Plan(second)])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("POST /nothing")])
        .script("rest", vec![text("GET /todos from todos")]);
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let completion = harness
        .engine
        .run(structural("app", "GET /todos"), input())
        .await
        .unwrap()
        .completion()
        .expect("second blueprint should pass");

    assert_eq!(implementation.call_count("api"), 3);
    let app_calls = implementation.calls_for("app");
    assert_eq!(app_calls.len(), 2);
    assert!(app_calls[0].feedback.is_empty());
    assert_eq!(app_calls[1].feedback.len(), 1);
    assert_eq!(
        app_calls[1].feedback[0].source,
        FeedbackSource::Child { node: "api".into() }
    );
    assert!(app_calls[1].feedback[0].message.contains("'api' failed after 3 attempt(s)"));

    assert!(completion.artifact.part(&"rest".into()).is_some());
    assert!(completion.artifact.part(&"api".into()).is_none());

    let api = completion
        .trace
        .iter()
        .find(|r| r.node_id().as_str() == "api")
        .unwrap();
    assert_eq!(api.unit.state(), UnitState::Exhausted);
    assert_eq!(api.parent_attempt, Some(1));
}

/// Scenario D: the root exhausts; the caller gets a partial result.
#[tokio::test]
async fn test_root_exhaustion_returns_partial_result() {
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(linear_blueprint())])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos from todos")])
        .script("ui", vec![text("<div>no list</div>")]);
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let partial = harness
        .engine
        .run(structural("app", "CREATE TABLE"), input())
        .await
        .unwrap()
        .partial()
        .expect("root should exhaust");

    assert_eq!(partial.root, NodeId::from("app"));
    assert_eq!(partial.failed_path, ExecutionPath::from_ids(&["app", "ui"]));
    assert_eq!(implementation.call_count("app"), 3);
    assert_eq!(implementation.call_count("ui"), 9);

    // db and api passed under each of the three parent attempts.
    assert_eq!(partial.salvaged.len(), 6);
    assert_eq!(
        partial.salvaged_for(&"db".into()),
        Some(&Artifact::text("CREATE TABLE todos"))
    );
    let attempts: Vec<Option<u32>> = partial
        .salvaged
        .iter()
        .filter(|s| s.scope.last() == Some(&NodeId::from("api")))
        .map(|s| s.parent_attempt)
        .collect();
    assert_eq!(attempts, vec![Some(1), Some(2), Some(3)]);

    // Root feedback first, then the exhausted child's own log.
    let scopes: Vec<String> = partial
        .feedback_trail
        .iter()
        .map(|e| e.scope.to_string())
        .collect();
    assert_eq!(scopes, vec!["app", "app", "app", "app/ui", "app/ui", "app/ui"]);

    let best = partial.best_effort();
    assert!(best.part(&"app/db".into()).is_some());
    assert!(best.part(&"app/ui".into()).is_none());
}

/// Scenario E: a dangling edge is rejected before any unit runs.
#[test]
fn test_dangling_edge_rejected_by_build() {
    let err = TaskGraph::build(
        vec![leaf("db", ""), leaf("api", "")],
        vec![EdgeSpec::new("db", "api", ""), EdgeSpec::new("ghost", "api", "")],
    )
    .unwrap_err();
    assert_eq!(err.kind, TopologyErrorKind::DanglingEdge);
    assert!(err.detail.contains("ghost"));
}

#[tokio::test]
async fn test_malformed_blueprint_schedules_no_child() {
    let dangling = Blueprint::new()
        .node(leaf("db", ""))
        .edge("db", "ghost", "");
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(dangling)])
        .script("db", vec![text("CREATE TABLE todos")]);
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let partial = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap()
        .partial()
        .unwrap();

    assert_eq!(implementation.call_count("db"), 0);
    assert_eq!(partial.failed_path, ExecutionPath::from_ids(&["app"]));
    assert!(partial
        .feedback_trail
        .iter()
        .all(|e| e.feedback.source == FeedbackSource::Blueprint));
    assert!(partial.feedback_trail[0]
        .feedback
        .message
        .contains("dangling edge"));
}

#[tokio::test]
async fn test_dependencies_see_latest_passed_artifact() {
    // api's first version fails its object rule; ui must only ever see v2.
    let mut blueprint = linear_blueprint();
    blueprint.nodes[1].object_contract.rule = "v2".to_string();

    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(blueprint)])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos v1 todos"), text("GET /todos v2 todos")])
        .script("ui", vec![text("<TodoList src='/todos'/>")]);
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let outcome = harness.engine.run(structural("app", ""), input()).await.unwrap();
    assert!(outcome.is_completed());

    let ui = implementation.calls_for("ui");
    assert_eq!(ui.len(), 1);
    assert_eq!(
        ui[0].dependencies.get(&NodeId::from("api")),
        Some(&Artifact::text("GET /todos v2 todos"))
    );
    assert!(!ui[0].dependencies.contains_key(&NodeId::from("db")));

    let api = implementation.calls_for("api");
    assert_eq!(api.len(), 2);
    assert_eq!(
        api[0].dependencies.get(&NodeId::from("db")),
        Some(&Artifact::text("CREATE TABLE todos"))
    );
}

#[tokio::test]
async fn test_nested_structural_units() {
    let top = Blueprint::new()
        .node(structural("backend", "CREATE TABLE"))
        .node(leaf("ui", "<TodoList"))
        .edge("backend", "ui", "");
    let backend = Blueprint::new()
        .node(leaf("db", "CREATE TABLE"))
        .node(leaf("api", "GET /todos"))
        .edge("db", "api", "todos");

    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(top)])
        .script("backend", vec![Step::Plan(backend)])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos from todos")])
        .script("ui", vec![text("<TodoList/>")]);
    let harness = EngineHarness::new(
        implementation.clone(),
        MockValidator::new(),
        EngineConfig::default(),
    );

    let completion = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap()
        .completion()
        .unwrap();

    let depth = |node: &str| implementation.calls_for(node)[0].depth;
    assert_eq!(depth("app"), 0);
    assert_eq!(depth("backend"), 1);
    assert_eq!(depth("db"), 2);

    let backend_artifact = completion.artifact.part(&"backend".into()).unwrap();
    assert_eq!(
        backend_artifact.part(&"db".into()),
        Some(&Artifact::text("CREATE TABLE todos"))
    );
    // ui's incoming path is backend's path: db -> api -> backend.
    assert_eq!(
        completion.budget.stages(&StagePath::from_scopes(&[
            "app/backend/db",
            "app/backend/api",
            "app/backend",
            "app/ui",
        ])),
        4
    );

    let db = completion
        .trace
        .iter()
        .find(|r| r.node_id().as_str() == "db")
        .unwrap();
    assert_eq!(db.scope, ExecutionPath::from_ids(&["app", "backend", "db"]));
}

/// Test: a node id reused one level down is a separate stage.
/// Given `db` at the top level (ε = 0.1) and another `db` inside `backend`
/// When both pass
/// Then `ui` still carries the top-level `db`'s error.
#[tokio::test]
async fn test_reused_id_in_nested_blueprint_keeps_both_stages() {
    let top = Blueprint::new()
        .node(structural("backend", ""))
        .node(leaf("db", "outer schema"))
        .node(leaf("ui", "<TodoList"))
        .edge("db", "ui", "");
    let backend = Blueprint::new().node(leaf("db", "inner schema"));

    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(top)])
        .script("backend", vec![Step::Plan(backend)])
        .script("db", vec![Step::Echo])
        .script("ui", vec![text("<TodoList/>")]);
    let validator = MockValidator::new()
        .score_rule("outer schema", 0.1)
        .score_rule("inner schema", 0.0);
    let mut harness = EngineHarness::new(implementation, validator, EngineConfig::default());

    let completion = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap()
        .completion()
        .unwrap();

    let outer = StagePath::from_scopes(&["app/db"]);
    let inner = StagePath::from_scopes(&["app/backend/db"]);
    assert!(approx(completion.budget.bound(&outer), 0.1));
    assert!(approx(completion.budget.bound(&inner), 0.0));

    let ui = outer.then(&ExecutionPath::from_ids(&["app", "ui"]));
    assert_eq!(completion.budget.stages(&ui), 2);
    assert!(approx(completion.budget.bound(&ui), 0.1));

    assert_eq!(completion.path, ui.then(&ExecutionPath::from_ids(&["app"])));
    assert!(approx(completion.error_bound(), 0.1));

    let passed_dbs: Vec<ExecutionPath> = harness
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, EngineEvent::UnitPassed { .. }))
        .filter(|e| e.node() == Some(&NodeId::from("db")))
        .map(|e| e.scope().clone())
        .collect();
    assert_eq!(passed_dbs.len(), 2);
    assert!(passed_dbs.contains(&ExecutionPath::from_ids(&["app", "db"])));
    assert!(passed_dbs.contains(&ExecutionPath::from_ids(&["app", "backend", "db"])));
}

#[tokio::test]
async fn test_depth_limit_runs_nested_structural_as_leaf() {
    let top = Blueprint::new().node(structural("backend", "server"));
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(top)])
        .script("backend", vec![text("server written directly")]);
    let config = EngineConfig {
        max_depth: 1,
        ..Default::default()
    };
    let harness = EngineHarness::new(implementation.clone(), MockValidator::new(), config);

    let completion = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap()
        .completion()
        .unwrap();

    let backend = completion
        .trace
        .iter()
        .find(|r| r.node_id().as_str() == "backend")
        .unwrap();
    assert_eq!(backend.kind, NodeKind::Leaf);
    assert_eq!(backend.artifact, Some(Artifact::text("server written directly")));
}

#[tokio::test]
async fn test_error_ceiling_aborts_run() {
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(linear_blueprint())])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("GET /todos from todos")])
        .script("ui", vec![text("<TodoList src='/todos'/>")]);
    let validator = MockValidator::new()
        .score("db", 0.1)
        .score("api", 0.1)
        .score("ui", 0.1);
    let config = EngineConfig {
        error_ceiling: Some(0.25),
        ..Default::default()
    };
    let harness = EngineHarness::new(implementation.clone(), validator, config);

    let err = harness
        .engine
        .run(structural("app", ""), input())
        .await
        .unwrap_err();
    match err {
        Error::BudgetExceeded { path, .. } => assert_eq!(path, "db/api/ui"),
        other => panic!("expected BudgetExceeded, got {}", other),
    }
    assert_eq!(implementation.call_count("ui"), 1);
}

#[tokio::test]
async fn test_event_stream_for_single_leaf() {
    let implementation = MockImplementation::new().script("db", vec![text("x"), text("CREATE TABLE")]);
    let mut harness =
        EngineHarness::new(implementation, MockValidator::new(), EngineConfig::default());

    harness
        .engine
        .run(leaf("db", "CREATE TABLE"), input())
        .await
        .unwrap();

    let events = harness.drain_events();
    assert!(matches!(events[0], EngineEvent::UnitStarted { depth: 0, .. }));
    assert!(matches!(events[1], EngineEvent::AttemptStarted { attempt: 1, .. }));
    assert!(matches!(events[2], EngineEvent::AttemptFailed { attempt: 1, .. }));
    assert!(matches!(events[3], EngineEvent::AttemptStarted { attempt: 2, .. }));
    assert!(matches!(events[4], EngineEvent::UnitPassed { attempts: 2, .. }));
    assert_eq!(events.len(), 5);
}

/// Grades its own work.
struct SelfReviewer;

#[async_trait::async_trait]
impl Implementation for SelfReviewer {
    async fn execute(
        &self,
        _node: &TaskNode,
        _context: &validag::core::AttemptContext,
    ) -> Result<Production, CapabilityError> {
        Ok(Production::text("done"))
    }
}

#[async_trait::async_trait]
impl Validator for SelfReviewer {
    async fn validate(
        &self,
        node: &TaskNode,
        _candidate: &Artifact,
        _dependencies: &validag::core::DependencyArtifacts,
    ) -> Result<ValidationResult, CapabilityError> {
        Ok(ValidationResult::judge(0.0, 0.0, node.thresholds(), ""))
    }
}

#[test]
fn test_same_instance_for_both_roles_is_rejected() {
    let reviewer = Arc::new(SelfReviewer);
    let err = Capabilities::builder()
        .implementation(reviewer.clone())
        .validator(reviewer)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Orthogonality { .. }));
}

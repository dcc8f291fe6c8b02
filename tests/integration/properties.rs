//! Property tests for graph scheduling, retry accounting, validation and
//! the error bound.

use std::collections::HashMap;

use proptest::prelude::*;
use validag::core::{DependencyArtifacts, UnitState};
use validag::orchestration::{EngineConfig, EngineEvent, Validator};
use validag::scripted::RegexValidator;
use validag::{
    Artifact, EdgeSpec, ErrorBudget, ExecutionPath, InputContext, NodeId, StagePath, TaskGraph,
    TopologyErrorKind,
};

use crate::fixtures::{
    leaf, linear_blueprint, structural, text, EngineHarness, MockImplementation, MockValidator,
    Step,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn id(i: usize) -> String {
    format!("n{}", i)
}

/// A random DAG: nodes inserted in shuffled order, edges always running
/// from a lower to a higher number.
fn arb_dag() -> impl Strategy<Value = (Vec<usize>, Vec<(usize, usize)>)> {
    (1usize..12)
        .prop_flat_map(|n| {
            (
                Just((0..n).collect::<Vec<_>>()).prop_shuffle(),
                prop::collection::vec((0..n, 0..n), 0..(n * 2)),
            )
        })
        .prop_map(|(order, pairs)| {
            let edges = pairs
                .into_iter()
                .filter(|(a, b)| a != b)
                .map(|(a, b)| (a.min(b), a.max(b)))
                .collect();
            (order, edges)
        })
}

fn build(order: &[usize], edges: &[(usize, usize)]) -> TaskGraph {
    let nodes = order.iter().map(|i| leaf(&id(*i), "")).collect();
    let edges = edges
        .iter()
        .map(|(a, b)| EdgeSpec::new(id(*a).as_str(), id(*b).as_str(), ""))
        .collect();
    TaskGraph::build(nodes, edges).unwrap()
}

proptest! {
    #[test]
    fn prop_topological_order_respects_every_edge((order, edges) in arb_dag()) {
        let graph = build(&order, &edges);
        let sorted = graph.topological_order();
        prop_assert_eq!(sorted.len(), order.len());

        let position: HashMap<NodeId, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, node)| (node.clone(), i))
            .collect();
        prop_assert_eq!(position.len(), order.len());
        for (a, b) in &edges {
            prop_assert!(position[&NodeId::from(id(*a))] < position[&NodeId::from(id(*b))]);
        }
    }

    #[test]
    fn prop_groups_cover_nodes_once_after_their_dependencies((order, edges) in arb_dag()) {
        let graph = build(&order, &edges);
        let groups = graph.independent_groups();

        let mut group_of: HashMap<NodeId, usize> = HashMap::new();
        for (g, group) in groups.iter().enumerate() {
            prop_assert!(!group.is_empty());
            for node in group {
                prop_assert!(group_of.insert(node.clone(), g).is_none(), "{} scheduled twice", node);
            }
        }
        prop_assert_eq!(group_of.len(), order.len());
        for (a, b) in &edges {
            prop_assert!(group_of[&NodeId::from(id(*a))] < group_of[&NodeId::from(id(*b))]);
        }
    }

    #[test]
    fn prop_back_edge_is_always_a_cycle(
        (order, edges) in arb_dag(),
        len in 2usize..6,
    ) {
        // Chain n0 -> n1 -> ... -> n(len-1) -> n0 alongside the random edges.
        let n = order.len().max(len);
        let mut nodes: Vec<_> = (0..n).map(|i| leaf(&id(i), "")).collect();
        nodes.reverse();
        let mut specs: Vec<EdgeSpec> = edges
            .iter()
            .map(|(a, b)| EdgeSpec::new(id(*a).as_str(), id(*b).as_str(), ""))
            .collect();
        for i in 0..len - 1 {
            specs.push(EdgeSpec::new(id(i).as_str(), id(i + 1).as_str(), ""));
        }
        specs.push(EdgeSpec::new(id(len - 1).as_str(), id(0).as_str(), ""));

        let err = TaskGraph::build(nodes, specs).unwrap_err();
        prop_assert_eq!(err.kind, TopologyErrorKind::Cycle);
    }

    #[test]
    fn prop_attempts_never_exceed_retries(max_retries in 1u32..6, pass_at in 1u32..8) {
        let mut steps = vec![text("draft"); (pass_at - 1) as usize];
        steps.push(text("final"));
        let implementation = MockImplementation::new().script("app", steps);
        let config = EngineConfig {
            max_retries,
            ..Default::default()
        };
        let mut harness = EngineHarness::new(implementation.clone(), MockValidator::new(), config);

        let outcome = runtime()
            .block_on(harness.engine.run(leaf("app", "final"), InputContext::new("goal")))
            .unwrap();

        let expected_attempts = pass_at.min(max_retries);
        let calls = implementation.calls_for("app");
        prop_assert_eq!(calls.len() as u32, expected_attempts);
        for call in &calls {
            prop_assert!(call.attempt <= max_retries);
            // Feedback only grows: call k carries the k-1 earlier rejections.
            prop_assert_eq!(call.feedback.len() as u32, call.attempt - 1);
            for (i, feedback) in call.feedback.iter().enumerate() {
                prop_assert_eq!(feedback.attempt, i as u32 + 1);
            }
        }

        let record = outcome
            .trace()
            .iter()
            .find(|r| r.node_id().as_str() == "app")
            .cloned()
            .unwrap();
        prop_assert_eq!(record.unit.attempt(), expected_attempts);

        let exhausted_events = harness
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, EngineEvent::UnitExhausted { .. }))
            .count();
        if pass_at <= max_retries {
            prop_assert!(outcome.is_completed());
            prop_assert_eq!(record.unit.state(), UnitState::Passed);
            prop_assert_eq!(exhausted_events, 0);
        } else {
            prop_assert!(!outcome.is_completed());
            prop_assert_eq!(record.unit.state(), UnitState::Exhausted);
            prop_assert_eq!(record.unit.feedback_log().len() as u32, max_retries);
            prop_assert_eq!(exhausted_events, 1);
        }
    }

    #[test]
    fn prop_bound_is_error_sum_plus_discrepancy_per_join(
        errors in prop::collection::vec(0.0f64..0.2, 1..8),
        discrepancy in 0.0f64..0.1,
    ) {
        let mut budget = ErrorBudget::new();
        let mut path = StagePath::root();
        for (i, epsilon) in errors.iter().enumerate() {
            let name = id(i);
            path = path.then(&ExecutionPath::from_ids(&["app", name.as_str()]));
            budget.record(&path, *epsilon, discrepancy);
        }

        let expected: f64 =
            errors.iter().sum::<f64>() + discrepancy * (errors.len() - 1) as f64;
        prop_assert_eq!(budget.stages(&path), errors.len());
        prop_assert!((budget.bound(&path) - expected).abs() < 1e-9);
    }

    #[test]
    fn prop_regex_validation_is_idempotent(
        content in "[a-z ]{0,24}",
        rule in "[a-z]{1,3}",
        dep_content in "[a-z ]{0,12}",
        edge_rule in "[a-z]{0,2}",
    ) {
        let graph = TaskGraph::build(
            vec![leaf("db", ""), leaf("api", &rule)],
            vec![EdgeSpec::new("db", "api", &edge_rule)],
        )
        .unwrap();
        let node = graph.node(&NodeId::from("api")).unwrap();
        let mut dependencies = DependencyArtifacts::new();
        dependencies.insert(NodeId::from("db"), Artifact::text(dep_content));
        let candidate = Artifact::text(content);

        let validator = RegexValidator::new();
        let rt = runtime();
        let first = rt.block_on(validator.validate(node, &candidate, &dependencies)).unwrap();
        let second = rt.block_on(validator.validate(node, &candidate, &dependencies)).unwrap();
        prop_assert_eq!(first, second);
    }
}

/// Test: every artifact the engine accepted still passes when validated again.
#[tokio::test]
async fn test_accepted_artifacts_revalidate_as_passed() {
    let implementation = MockImplementation::new()
        .script("app", vec![Step::Plan(linear_blueprint())])
        .script("db", vec![text("CREATE TABLE todos")])
        .script("api", vec![text("SELECT todos"), text("GET /todos from todos")])
        .script("ui", vec![text("<TodoList src=/todos>")]);
    let validator = MockValidator::new();
    let harness = EngineHarness::new(implementation, validator.clone(), EngineConfig::default());

    let outcome = harness
        .engine
        .run(structural("app", ""), InputContext::new("goal"))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let accepted: Vec<_> = validator.checks().into_iter().filter(|c| c.passed).collect();
    assert_eq!(accepted.len(), 4);
    for check in accepted {
        let again = validator
            .validate(&check.task, &check.candidate, &check.dependencies)
            .await
            .unwrap();
        assert!(again.passed, "{} no longer passes", check.node);
    }
}

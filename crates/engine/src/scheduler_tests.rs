//! Integration-style coverage for the scheduler driving whole graphs, as
//! opposed to the unit tests living alongside each component.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use nodes::mock::MockNode;
use nodes::{ExecutableNode, ExecutionContext, NodeError, NodeInput};

use crate::dag::{Dag, NodeOptions};
use crate::error::EngineError;
use crate::scheduler::{execute, ExecutionOptions};

fn passthrough(id: &str) -> Arc<dyn ExecutableNode> {
    Arc::new(MockNode::returning(id, json!({})))
}

#[tokio::test]
async fn linear_chain_runs_every_node_to_success() {
    let mut dag = Dag::new();
    dag.add_node("a", passthrough("a"), NodeOptions::default()).unwrap();
    dag.add_node("b", passthrough("b"), NodeOptions::default()).unwrap();
    dag.add_node("c", passthrough("c"), NodeOptions::default()).unwrap();
    dag.connect("a", "b").unwrap();
    dag.connect("b", "c").unwrap();

    let report = execute(&dag, json!({"seed": true}), ExecutionOptions::default(), None).await.unwrap();

    assert!(report.summary.success);
    assert_eq!(report.summary.nodes_succeeded, 3);
    assert_eq!(report.results.len(), 3);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn diamond_runs_all_branches_and_joins_at_the_sink() {
    let mut dag = Dag::new();
    for id in ["a", "b", "c", "d"] {
        dag.add_node(id, passthrough(id), NodeOptions::default()).unwrap();
    }
    dag.connect("a", "b").unwrap();
    dag.connect("a", "c").unwrap();
    dag.connect("b", "d").unwrap();
    dag.connect("c", "d").unwrap();

    let report = execute(&dag, json!(null), ExecutionOptions::default(), None).await.unwrap();

    assert!(report.summary.success);
    assert_eq!(report.summary.nodes_succeeded, 4);
    assert!(report.results.contains_key("d"));
}

#[tokio::test]
async fn optional_failure_with_graceful_degradation_still_succeeds() {
    // A -> B -> C, A -> C; B is optional and always fails.
    let mut dag = Dag::new();
    dag.add_node("a", passthrough("a"), NodeOptions::default()).unwrap();
    dag.add_node(
        "b",
        Arc::new(MockNode::failing_fatal("b", "always fails")),
        NodeOptions { optional: true, retries: Some(0), ..Default::default() },
    )
    .unwrap();
    dag.add_node("c", passthrough("c"), NodeOptions::default()).unwrap();
    dag.connect("a", "b").unwrap();
    dag.connect("a", "c").unwrap();

    let mut required_nodes = HashSet::new();
    required_nodes.insert("a".to_string());
    required_nodes.insert("c".to_string());

    let options =
        ExecutionOptions { graceful_degradation: true, required_nodes, ..ExecutionOptions::default() };
    let report = execute(&dag, json!(null), options, None).await.unwrap();

    assert!(report.summary.success);
    assert!(report.results.contains_key("a"));
    assert!(report.results.contains_key("c"));
    assert!(!report.results.contains_key("b"));
    assert!(report.failures.is_empty());
    assert_eq!(report.summary.nodes_skipped, 1);
}

struct FlakyThenOk {
    calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl ExecutableNode for FlakyThenOk {
    async fn execute(&self, _input: NodeInput, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n < 2 {
            Err(NodeError::Retryable("not ready yet".into()))
        } else {
            Ok(json!({"attempt": n}))
        }
    }
}

#[tokio::test]
async fn retry_with_eventual_success_recovers_without_failing_the_graph() {
    let mut dag = Dag::new();
    let run = Arc::new(FlakyThenOk { calls: std::sync::atomic::AtomicU32::new(0) });
    dag.add_node("a", run, NodeOptions { retries: Some(5), ..Default::default() }).unwrap();

    let policy = Arc::new(crate::retry::RetryPolicy::with_sleep(
        crate::retry::RetryPolicyConfig::default(),
        Arc::new(|_| Box::pin(async {})),
    ));
    let options = ExecutionOptions { retry_policy: Some(policy), ..ExecutionOptions::default() };
    let report = execute(&dag, json!(null), options, None).await.unwrap();

    assert!(report.summary.success);
    assert!(report.results.contains_key("a"));
}

struct AlwaysRetryable;

#[async_trait]
impl ExecutableNode for AlwaysRetryable {
    async fn execute(&self, _input: NodeInput, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Err(NodeError::Retryable("still failing".into()))
    }
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_as_a_distinct_failure() {
    let mut dag = Dag::new();
    dag.add_node("a", Arc::new(AlwaysRetryable), NodeOptions { retries: Some(100), ..Default::default() })
        .unwrap();

    let mut config = crate::retry::RetryPolicyConfig::default();
    config.retry_budget.max_retries_per_window = 1;
    let policy =
        Arc::new(crate::retry::RetryPolicy::with_sleep(config, Arc::new(|_| Box::pin(async {}))));
    let options = ExecutionOptions { retry_policy: Some(policy), ..ExecutionOptions::default() };
    let report = execute(&dag, json!(null), options, None).await.unwrap();

    assert!(!report.summary.success);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, EngineError::RetryBudgetExhausted));
}

struct SleepNode {
    duration: Duration,
}

#[async_trait]
impl ExecutableNode for SleepNode {
    async fn execute(&self, _input: NodeInput, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        tokio::select! {
            _ = tokio::time::sleep(self.duration) => Ok(json!({"slept": true})),
            _ = ctx.cancellation.cancelled() => Err(NodeError::Fatal("cancelled while sleeping".into())),
        }
    }
}

#[tokio::test]
async fn global_timeout_cancels_the_graph() {
    let mut dag = Dag::new();
    for i in 0..10 {
        let id = format!("n{i}");
        dag.add_node(
            id,
            Arc::new(SleepNode { duration: Duration::from_millis(100) }),
            NodeOptions { retries: Some(0), ..Default::default() },
        )
        .unwrap();
    }

    let options =
        ExecutionOptions { timeout: Some(Duration::from_millis(50)), concurrency: 10, ..ExecutionOptions::default() };
    let report = execute(&dag, json!(null), options, None).await.unwrap();

    assert!(!report.summary.success);
    for failure in &report.failures {
        assert!(!report.results.contains_key(&failure.node_id));
    }
    assert!(report.failures.iter().any(|f| matches!(f.error, EngineError::Cancelled)));
}

#[tokio::test]
async fn required_node_failure_without_continue_on_error_blocks_its_successors() {
    let mut dag = Dag::new();
    dag.add_node("a", Arc::new(MockNode::failing_fatal("a", "boom")), NodeOptions { retries: Some(0), ..Default::default() })
        .unwrap();
    dag.add_node("b", passthrough("b"), NodeOptions::default()).unwrap();
    dag.connect("a", "b").unwrap();

    let report = execute(&dag, json!(null), ExecutionOptions::default(), None).await.unwrap();

    assert!(!report.summary.success);
    assert!(!report.results.contains_key("b"));
    assert_eq!(report.summary.nodes_blocked, 1);
}

#[tokio::test]
async fn continue_on_error_still_runs_unrelated_branches() {
    let mut dag = Dag::new();
    dag.add_node("a", Arc::new(MockNode::failing_fatal("a", "boom")), NodeOptions { retries: Some(0), ..Default::default() })
        .unwrap();
    dag.add_node("b", passthrough("b"), NodeOptions::default()).unwrap();
    dag.add_node("unrelated", passthrough("unrelated"), NodeOptions::default()).unwrap();
    dag.connect("a", "b").unwrap();

    let options = ExecutionOptions { continue_on_error: true, ..ExecutionOptions::default() };
    let report = execute(&dag, json!(null), options, None).await.unwrap();

    assert!(!report.summary.success);
    assert!(!report.results.contains_key("b"));
    assert!(report.results.contains_key("unrelated"));
}

#[tokio::test]
async fn empty_dag_is_rejected_before_any_node_runs() {
    let dag = Dag::new();
    let err = execute(&dag, json!(null), ExecutionOptions::default(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::DagInvalid(crate::error::DagError::Empty)));
}

#[tokio::test]
async fn zero_timeout_node_reports_node_timeout_as_its_failure() {
    let mut dag = Dag::new();
    dag.add_node(
        "a",
        passthrough("a"),
        NodeOptions { timeout: Some(Duration::ZERO), retries: Some(0), ..Default::default() },
    )
    .unwrap();

    let report = execute(&dag, json!(null), ExecutionOptions::default(), None).await.unwrap();

    assert!(!report.summary.success);
    assert!(matches!(report.failures[0].error, EngineError::NodeTimeout { .. }));
}

#[tokio::test]
async fn single_sink_result_is_reachable_via_single_result() {
    let mut dag = Dag::new();
    dag.add_node("only", passthrough("only"), NodeOptions::default()).unwrap();

    let report = execute(&dag, json!(null), ExecutionOptions::default(), None).await.unwrap();

    assert!(report.single_result().is_some());
}

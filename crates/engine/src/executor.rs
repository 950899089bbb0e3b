//! Single-node execution: builds the node's input, drives it through its
//! retry policy, and classifies the terminal result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use nodes::{ExecutionContext, NodeInput};

use crate::dag::Node;
use crate::error::EngineError;
use crate::observability::{self, EngineEvent, EventSink, NodeOutcomeKind};
use crate::retry::RetryPolicy;

/// The terminal shape of one node's execution.
#[derive(Debug)]
pub enum NodeOutcome {
    Success(Value),
    /// The node failed, but it is optional and graceful degradation is on,
    /// so its result simply won't be present in downstream
    /// `NodeInput::Deps` maps.
    SkippedOptional,
    Failed(EngineError),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, NodeOutcome::Success(_))
    }

    fn kind(&self) -> NodeOutcomeKind {
        match self {
            NodeOutcome::Success(_) => NodeOutcomeKind::Success,
            NodeOutcome::SkippedOptional => NodeOutcomeKind::SkippedOptional,
            NodeOutcome::Failed(_) => NodeOutcomeKind::Failed,
        }
    }
}

/// Either a source node's seed value, or its predecessors' published results.
pub enum NodeInputSource<'a> {
    Seed(&'a Value),
    Deps(&'a HashMap<String, Value>),
}

fn build_input(source: NodeInputSource<'_>) -> NodeInput {
    match source {
        NodeInputSource::Seed(v) => NodeInput::Seed(v.clone()),
        NodeInputSource::Deps(m) => NodeInput::Deps(m.clone()),
    }
}

/// Run one node to completion (success, skip, or failure), honoring its
/// timeout, retry policy, and cooperative cancellation.
///
/// `default_policy` is used when the node carries no `retry_policy` of its
/// own; `graceful_degradation` decides whether an optional node's terminal
/// failure is reported as [`NodeOutcome::SkippedOptional`] rather than
/// [`NodeOutcome::Failed`].
pub async fn execute_node(
    node: &Node,
    input: NodeInputSource<'_>,
    ctx: &ExecutionContext,
    default_policy: &Arc<RetryPolicy>,
    graceful_degradation: bool,
    sink: Option<&EventSink>,
) -> NodeOutcome {
    let start = Instant::now();
    observability::emit(
        sink,
        EngineEvent::NodeStart { correlation_id: ctx.correlation_id.clone(), node_id: node.id.clone() },
    );

    let input = build_input(input);
    let policy = node.retry_policy.as_ref().unwrap_or(default_policy);
    let timeout = node.timeout;

    let attempt_count = std::sync::atomic::AtomicU32::new(0);
    let result = policy
        .execute(&node.id, node.retries, sink, || {
            attempt_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            run_one_attempt(node, &input, ctx, timeout)
        })
        .await;
    let attempts = attempt_count.load(std::sync::atomic::Ordering::Relaxed).max(1);

    let outcome = match result {
        Ok(value) => NodeOutcome::Success(value),
        Err(err) if node.optional && graceful_degradation => {
            let _ = &err;
            NodeOutcome::SkippedOptional
        }
        Err(err) => NodeOutcome::Failed(err),
    };

    node.metrics.record(outcome.kind(), start.elapsed(), attempts.saturating_sub(1));
    observability::emit(
        sink,
        EngineEvent::NodeEnd {
            correlation_id: ctx.correlation_id.clone(),
            node_id: node.id.clone(),
            outcome: outcome.kind(),
            duration: start.elapsed(),
            attempts,
        },
    );

    outcome
}

/// One attempt: a zero timeout fails immediately without invoking the node
/// (there is no useful attempt to race against a timeout that has already
/// elapsed), cancellation is checked before the node runs, and everything
/// else is raced against `tokio::time::timeout`.
async fn run_one_attempt(
    node: &Node,
    input: &NodeInput,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> Result<Value, EngineError> {
    if ctx.is_cancelled() {
        return Err(EngineError::Cancelled);
    }
    if timeout.is_zero() {
        return Err(EngineError::NodeTimeout { node_id: node.id.clone(), after: timeout });
    }

    match tokio::time::timeout(timeout, node.run.execute(input.clone(), ctx)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(node_err)) => Err(EngineError::from(node_err)),
        Err(_elapsed) => Err(EngineError::NodeTimeout { node_id: node.id.clone(), after: timeout }),
    }
}

//! Drives an entire [`Dag`] to completion: bounded-concurrency admission,
//! dependency gating, partial-failure policy, and cancellation.
//!
//! Node futures are admitted onto a [`FuturesUnordered`] rather than spawned
//! as detached `tokio` tasks — they borrow the `Dag` they're scheduled
//! against, which would otherwise fight the `'static` bound `tokio::spawn`
//! imposes. Polling them concurrently from this one future still gives every
//! suspension point (worker-slot admission, retry backoff, per-attempt
//! timeout) a chance to interleave, which is what "bounded concurrency"
//! actually buys here.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;

use nodes::ExecutionContext;

use crate::dag::{Dag, NodeId};
use crate::error::EngineError;
use crate::executor::{execute_node, NodeInputSource, NodeOutcome};
use crate::observability::{self, EngineEvent, EngineMetrics, EventSink};
use crate::retry::{RetryPolicy, RetryPolicyConfig};

fn default_concurrency() -> usize {
    std::env::var("RAG_MAX_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(5)
}

/// Per-execution tuning. Constructed fresh for each call to [`execute`].
pub struct ExecutionOptions {
    /// Overall deadline for the whole graph. `None` means no global deadline.
    pub timeout: Option<Duration>,
    /// Maximum number of nodes admitted concurrently.
    pub concurrency: usize,
    /// If true, a required node's failure does not cancel the graph; the
    /// scheduler keeps admitting unrelated ready work. The overall result is
    /// still a failure.
    pub continue_on_error: bool,
    /// Enables optional-node skipping on terminal failure.
    pub graceful_degradation: bool,
    /// Explicitly required node ids, beyond the implicit `!optional` set.
    pub required_nodes: HashSet<NodeId>,
    /// Retry policy shared by nodes that don't carry their own. Defaults to
    /// a fresh policy with [`RetryPolicyConfig::default`].
    pub retry_policy: Option<Arc<RetryPolicy>>,
    /// Correlation id threaded through every emitted event. A random one is
    /// generated when absent.
    pub correlation_id: Option<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            concurrency: default_concurrency(),
            continue_on_error: false,
            graceful_degradation: false,
            required_nodes: HashSet::new(),
            retry_policy: None,
            correlation_id: None,
        }
    }
}

/// One node's terminal failure, as recorded in an [`ExecutionReport`].
#[derive(Debug, Clone)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub error: EngineError,
    /// Whether this node counted as required (explicitly in
    /// `requiredNodes`, or not `optional`) — the failures that decide
    /// `summary.success`.
    pub required: bool,
}

/// Aggregate counts over one execution, independent of the per-node detail
/// in [`ExecutionReport::results`]/`failures`.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSummary {
    /// True iff no required node's failure was recorded and the execution
    /// was not cancelled.
    pub success: bool,
    pub nodes_total: usize,
    pub nodes_succeeded: usize,
    pub nodes_skipped: usize,
    pub nodes_failed: usize,
    /// Nodes that never ran: dependents of a failed node (permanently
    /// unsatisfied), or ready work that cancellation stopped from admitting.
    pub nodes_blocked: usize,
    pub duration: Duration,
}

/// The full result of driving one [`Dag`] to completion.
#[derive(Debug)]
pub struct ExecutionReport {
    pub execution_id: uuid::Uuid,
    pub correlation_id: String,
    pub results: HashMap<NodeId, Value>,
    pub failures: Vec<NodeFailure>,
    pub summary: ExecutionSummary,
}

impl ExecutionReport {
    /// The result of the graph's one sink node, for simple single-output
    /// pipelines where threading a node id through call sites is needless
    /// ceremony. Returns `None` unless exactly one node produced a result.
    pub fn single_result(&self) -> Option<&Value> {
        if self.results.len() == 1 {
            self.results.values().next()
        } else {
            None
        }
    }
}

/// Run every node in `dag` to completion, starting source nodes from `seed`.
///
/// Returns `Err` only for [`EngineError::DagInvalid`], raised synchronously
/// before any node runs. Every other outcome — including partial failure and
/// cancellation — is reported as `Ok(ExecutionReport)` with
/// `summary.success == false`.
pub async fn execute(
    dag: &Dag,
    seed: Value,
    options: ExecutionOptions,
    sink: Option<EventSink>,
) -> Result<ExecutionReport, EngineError> {
    let order = dag.validate()?;
    let total_nodes = order.len();
    let start = Instant::now();

    let correlation_id = options
        .correlation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let ctx = ExecutionContext::new(correlation_id.clone());
    let execution_id = ctx.execution_id;

    let metrics = EngineMetrics::default();
    metrics.record_execution_start();
    let sink_ref = sink.as_ref();
    observability::emit(
        sink_ref,
        EngineEvent::ExecutionStart { correlation_id: correlation_id.clone(), total_nodes },
    );

    if let Some(timeout) = options.timeout {
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            token.cancel();
        });
    }

    let default_policy =
        options.retry_policy.clone().unwrap_or_else(|| Arc::new(RetryPolicy::new(RetryPolicyConfig::default())));

    let mut remaining_deps: HashMap<NodeId, usize> = HashMap::with_capacity(total_nodes);
    for id in &order {
        remaining_deps.insert(id.clone(), dag.dependencies(id).len());
    }
    let index_of: HashMap<&str, usize> = order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let mut ready: BinaryHeap<(i32, Reverse<usize>, NodeId)> = BinaryHeap::new();
    for id in dag.sources() {
        let node = dag.get_node(&id).expect("source id came from dag");
        ready.push((node.priority, Reverse(index_of[id.as_str()]), id));
    }

    let results: dashmap::DashMap<NodeId, Value> = dashmap::DashMap::new();
    let mut failures: Vec<NodeFailure> = Vec::new();
    let mut nodes_succeeded = 0usize;
    let mut nodes_skipped = 0usize;
    let mut nodes_failed = 0usize;
    let mut any_required_failure = false;

    let concurrency = options.concurrency.max(1);
    let mut in_flight: FuturesUnordered<_> = FuturesUnordered::new();

    loop {
        while in_flight.len() < concurrency && !ctx.is_cancelled() {
            let Some((_, _, id)) = ready.pop() else { break };
            let node = dag.get_node(&id).expect("node id came from dag");

            let dep_ids = dag.dependencies(&id);
            let is_source = dep_ids.is_empty();
            let deps_snapshot: HashMap<String, Value> = dep_ids
                .into_iter()
                .filter_map(|dep_id| results.get(&dep_id).map(|v| (dep_id, v.clone())))
                .collect();

            let ctx_ref = &ctx;
            let policy_ref = &default_policy;
            let seed_ref = &seed;
            let graceful = options.graceful_degradation;

            metrics.node_admitted();
            in_flight.push(async move {
                let input = if is_source {
                    NodeInputSource::Seed(seed_ref)
                } else {
                    NodeInputSource::Deps(&deps_snapshot)
                };
                let outcome = execute_node(node, input, ctx_ref, policy_ref, graceful, sink_ref).await;
                (id, outcome)
            });
        }

        if in_flight.is_empty() {
            break;
        }

        let (id, outcome) = in_flight.next().await.expect("in_flight is non-empty");
        metrics.node_completed();
        match outcome {
            NodeOutcome::Success(value) => {
                results.insert(id.clone(), value);
                nodes_succeeded += 1;
                for succ in dag.successors(&id) {
                    let degree = remaining_deps.get_mut(&succ).expect("successor tracked");
                    *degree -= 1;
                    if *degree == 0 {
                        let succ_node = dag.get_node(&succ).expect("successor in dag");
                        ready.push((succ_node.priority, Reverse(index_of[succ.as_str()]), succ));
                    }
                }
            }
            NodeOutcome::SkippedOptional => {
                nodes_skipped += 1;
                for succ in dag.successors(&id) {
                    let degree = remaining_deps.get_mut(&succ).expect("successor tracked");
                    *degree -= 1;
                    if *degree == 0 {
                        let succ_node = dag.get_node(&succ).expect("successor in dag");
                        ready.push((succ_node.priority, Reverse(index_of[succ.as_str()]), succ));
                    }
                }
            }
            NodeOutcome::Failed(err) => {
                // Cancellation replaces any in-flight node error that was
                // caused solely by it — we treat any failure observed after
                // cancellation was signalled as falling into that class.
                let err = if ctx.is_cancelled() { EngineError::Cancelled } else { err };
                nodes_failed += 1;
                let node = dag.get_node(&id).expect("node id came from dag");
                let required = options.required_nodes.contains(&id) || !node.optional;
                failures.push(NodeFailure { node_id: id.clone(), error: err, required });
                // The failed node's own successors are never enqueued — their
                // `remaining_deps` entry simply never reaches zero, which
                // cascades the block transitively with no extra bookkeeping.
                if required {
                    any_required_failure = true;
                    if !options.continue_on_error {
                        ctx.cancellation.cancel();
                    }
                }
            }
        }
    }

    let success = !any_required_failure && !ctx.is_cancelled();
    let nodes_blocked = total_nodes - nodes_succeeded - nodes_skipped - nodes_failed;
    let duration = start.elapsed();

    metrics.record_execution_end(success);
    observability::emit(
        sink_ref,
        EngineEvent::ExecutionEnd {
            correlation_id: correlation_id.clone(),
            success,
            duration,
            nodes_executed: nodes_succeeded + nodes_skipped + nodes_failed,
        },
    );

    Ok(ExecutionReport {
        execution_id,
        correlation_id,
        results: results.into_iter().collect(),
        failures,
        summary: ExecutionSummary {
            success,
            nodes_total: total_nodes,
            nodes_succeeded,
            nodes_skipped,
            nodes_failed,
            nodes_blocked,
            duration,
        },
    })
}

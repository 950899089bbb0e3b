//! Correlation context, structured events, and metrics accumulation.
//!
//! Every event below is both emitted as a `tracing` event (so any
//! `tracing-subscriber` layer can render or export it) and, when a sink is
//! registered, handed to that sink as a typed value. Metrics are kept as our
//! own atomics — so `RetryPolicy::metrics()` and `Node::metrics` stay
//! synchronous, dependency-free reads — and are additionally emitted through
//! the `metrics` facade macros so a process embedding this engine can wire up
//! any compatible exporter (e.g. Prometheus) without this crate depending on
//! one directly.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::retry::CircuitState;

/// Identifies one execution for the lifetime of all its log/metric events.
#[derive(Debug, Clone)]
pub struct CorrelationContext {
    pub execution_id: uuid::Uuid,
    pub correlation_id: String,
}

impl CorrelationContext {
    pub fn new(execution_id: uuid::Uuid) -> Self {
        Self {
            execution_id,
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// A structured event emitted over the lifetime of one execution.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ExecutionStart {
        correlation_id: String,
        total_nodes: usize,
    },
    ExecutionEnd {
        correlation_id: String,
        success: bool,
        duration: Duration,
        nodes_executed: usize,
    },
    NodeStart {
        correlation_id: String,
        node_id: String,
    },
    NodeEnd {
        correlation_id: String,
        node_id: String,
        outcome: NodeOutcomeKind,
        duration: Duration,
        attempts: u32,
    },
    RetryAttempt {
        correlation_id: String,
        node_id: String,
        attempt: u32,
        delay: Duration,
        cause: String,
    },
    CircuitStateChange {
        node_id: Option<String>,
        old: CircuitState,
        new: CircuitState,
        reason: &'static str,
    },
}

/// The terminal shape of a node's execution, for event reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcomeKind {
    Success,
    SkippedOptional,
    Failed,
}

impl fmt::Display for NodeOutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcomeKind::Success => write!(f, "success"),
            NodeOutcomeKind::SkippedOptional => write!(f, "skipped_optional"),
            NodeOutcomeKind::Failed => write!(f, "failed"),
        }
    }
}

/// Receives a typed copy of every [`EngineEvent`] emitted during execution.
/// Registered once per scheduler; independent of the `tracing` emission,
/// which always happens regardless of whether a sink is set.
pub type EventSink = std::sync::Arc<dyn Fn(EngineEvent) + Send + Sync>;

pub(crate) fn emit(sink: Option<&EventSink>, event: EngineEvent) {
    match &event {
        EngineEvent::ExecutionStart { correlation_id, total_nodes } => {
            tracing::info!(correlation_id, total_nodes, "dag.execution.start");
        }
        EngineEvent::ExecutionEnd { correlation_id, success, duration, nodes_executed } => {
            tracing::info!(
                correlation_id,
                success,
                duration_ms = duration.as_millis() as u64,
                nodes_executed,
                "dag.execution.end"
            );
        }
        EngineEvent::NodeStart { correlation_id, node_id } => {
            tracing::info!(correlation_id, node_id, "dag.node.start");
        }
        EngineEvent::NodeEnd { correlation_id, node_id, outcome, duration, attempts } => {
            tracing::info!(
                correlation_id,
                node_id,
                outcome = %outcome,
                duration_ms = duration.as_millis() as u64,
                attempts,
                "dag.node.end"
            );
        }
        EngineEvent::RetryAttempt { correlation_id, node_id, attempt, delay, cause } => {
            tracing::warn!(
                correlation_id,
                node_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                cause,
                "retry.attempt"
            );
        }
        EngineEvent::CircuitStateChange { node_id, old, new, reason } => {
            tracing::warn!(node_id = node_id.as_deref(), ?old, ?new, reason, "circuit.state.change");
        }
    }
    if let Some(sink) = sink {
        sink(event);
    }
}

/// Atomic, per-node accumulator. Shared across every execution of the same
/// node (a `Node` lives as long as its `Dag`).
#[derive(Debug, Default)]
pub struct NodeMetrics {
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    last_duration_ms: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl NodeMetrics {
    pub fn record(&self, outcome: NodeOutcomeKind, duration: Duration, retry_count: u32) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        match outcome {
            NodeOutcomeKind::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            NodeOutcomeKind::SkippedOptional => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            NodeOutcomeKind::Failed => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.retries.fetch_add(retry_count as u64, Ordering::Relaxed);
        let ms = duration.as_millis() as u64;
        self.last_duration_ms.store(ms, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);

        metrics::counter!("dag_node_executions_total").increment(1);
        metrics::histogram!("dag_node_duration_seconds").record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> NodeMetricsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let total_ms = self.total_duration_ms.load(Ordering::Relaxed);
        NodeMetricsSnapshot {
            executions,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            last_duration: Duration::from_millis(self.last_duration_ms.load(Ordering::Relaxed)),
            average_duration: if executions > 0 {
                Duration::from_millis(total_ms / executions)
            } else {
                Duration::ZERO
            },
        }
    }
}

/// A point-in-time read of a node's accumulated metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeMetricsSnapshot {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped: u64,
    pub retries: u64,
    pub last_duration: Duration,
    pub average_duration: Duration,
}

/// Engine-wide counters, independent of any one node.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    executions_started: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    nodes_in_flight: AtomicU64,
}

impl EngineMetrics {
    pub fn record_execution_start(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dag_executions_total").increment(1);
    }

    pub fn record_execution_end(&self, success: bool) {
        if success {
            self.executions_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn node_admitted(&self) {
        self.nodes_in_flight.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("dag_nodes_in_flight").increment(1.0);
    }

    pub fn node_completed(&self) {
        self.nodes_in_flight.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("dag_nodes_in_flight").decrement(1.0);
    }

    /// A minimal Prometheus text-exposition rendering of the engine-level
    /// counters. Per-node metrics are exported via the `metrics` facade
    /// macros above and are expected to be scraped through whatever exporter
    /// the embedding process installs.
    pub fn to_prometheus_text(&self) -> String {
        format!(
            "# HELP dag_executions_started_total Executions started\n\
             # TYPE dag_executions_started_total counter\n\
             dag_executions_started_total {}\n\
             # HELP dag_executions_succeeded_total Executions that completed successfully\n\
             # TYPE dag_executions_succeeded_total counter\n\
             dag_executions_succeeded_total {}\n\
             # HELP dag_executions_failed_total Executions that completed with a failure\n\
             # TYPE dag_executions_failed_total counter\n\
             dag_executions_failed_total {}\n\
             # HELP dag_nodes_in_flight Nodes currently executing\n\
             # TYPE dag_nodes_in_flight gauge\n\
             dag_nodes_in_flight {}\n",
            self.executions_started.load(Ordering::Relaxed),
            self.executions_succeeded.load(Ordering::Relaxed),
            self.executions_failed.load(Ordering::Relaxed),
            self.nodes_in_flight.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_metrics_accumulate_across_executions() {
        let metrics = NodeMetrics::default();
        metrics.record(NodeOutcomeKind::Success, Duration::from_millis(100), 0);
        metrics.record(NodeOutcomeKind::Failed, Duration::from_millis(200), 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.executions, 2);
        assert_eq!(snap.successes, 1);
        assert_eq!(snap.failures, 1);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.last_duration, Duration::from_millis(200));
        assert_eq!(snap.average_duration, Duration::from_millis(150));
    }

    #[test]
    fn engine_metrics_prometheus_text_contains_counters() {
        let metrics = EngineMetrics::default();
        metrics.record_execution_start();
        metrics.record_execution_end(true);
        let text = metrics.to_prometheus_text();
        assert!(text.contains("dag_executions_started_total 1"));
        assert!(text.contains("dag_executions_succeeded_total 1"));
    }
}

//! `engine` crate — DAG model, retry policy, node execution, and the
//! concurrent scheduler that drives a graph to completion.

pub mod dag;
pub mod error;
pub mod executor;
pub mod observability;
pub mod retry;
pub mod scheduler;

pub use dag::{Dag, Node, NodeId, NodeOptions};
pub use error::{DagError, EngineError};
pub use executor::{execute_node, NodeInputSource, NodeOutcome};
pub use observability::{CorrelationContext, EngineEvent, EngineMetrics, EventSink, NodeMetrics};
pub use retry::{CircuitBreakerConfig, CircuitState, RetryBudgetConfig, RetryPolicy, RetryPolicyConfig};
pub use scheduler::{execute, ExecutionOptions, ExecutionReport, ExecutionSummary, NodeFailure};

#[cfg(test)]
mod scheduler_tests;

//! Error taxonomy for the DAG model and the execution core.

use std::time::Duration;
use thiserror::Error;

/// Structural problems found while building or validating a [`crate::dag::Dag`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("duplicate node id: '{0}'")]
    DuplicateNodeId(String),

    #[error("unknown node '{node_id}' referenced on the {side} side of an edge")]
    UnknownNodeReference { node_id: String, side: &'static str },

    #[error("self-loop on node '{0}' is not allowed")]
    SelfLoop(String),

    #[error("cycle detected, involving node '{0}'")]
    CycleDetected(String),

    #[error("a dag must contain at least one node")]
    Empty,
}

/// Errors produced while executing a validated [`crate::dag::Dag`].
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// The dag failed validation; raised synchronously, before any node runs.
    #[error("dag invalid: {0}")]
    DagInvalid(#[from] DagError),

    /// A single attempt exceeded the node's per-attempt timeout.
    #[error("node '{node_id}' exceeded its {after:?} timeout")]
    NodeTimeout { node_id: String, after: Duration },

    /// The retry policy's overall deadline elapsed across the whole loop.
    #[error("retry policy timed out after {attempts} attempt(s)")]
    OperationTimeout { attempts: u32 },

    /// The circuit breaker rejected the attempt without running it.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Every permitted retry was consumed without success.
    #[error("retry attempts exhausted after {attempts} attempt(s): {cause}")]
    RetryExhausted { attempts: u32, cause: String },

    /// The sliding-window retry budget had no capacity left.
    #[error("retry budget exhausted for the current window")]
    RetryBudgetExhausted,

    /// An error raised by user node code, tagged with whether the retry
    /// policy's default classification considers it retryable.
    #[error("{message}")]
    UserError { message: String, retryable: bool },

    /// Execution was cancelled (global timeout or a required-node failure
    /// with `continueOnError = false`).
    #[error("execution cancelled")]
    Cancelled,
}

impl From<nodes::NodeError> for EngineError {
    fn from(err: nodes::NodeError) -> Self {
        match err {
            nodes::NodeError::Retryable(message) => EngineError::UserError { message, retryable: true },
            nodes::NodeError::Fatal(message) => EngineError::UserError { message, retryable: false },
        }
    }
}

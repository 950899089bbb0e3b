//! The `ExecutableNode` trait and the shapes that flow through it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::NodeError;

/// The input handed to a node's `execute` method.
///
/// A node with no predecessors receives the execution's seed value directly.
/// A node with one or more predecessors receives their published results,
/// keyed by node id. A predecessor that was skipped under graceful
/// degradation, or that failed, is simply absent from the map rather than
/// present under a null or error marker.
#[derive(Debug, Clone)]
pub enum NodeInput {
    Seed(Value),
    Deps(HashMap<String, Value>),
}

impl NodeInput {
    /// The seed value, if this is a source node's input.
    pub fn as_seed(&self) -> Option<&Value> {
        match self {
            NodeInput::Seed(v) => Some(v),
            NodeInput::Deps(_) => None,
        }
    }

    /// The full predecessor-result map, if this node has predecessors.
    pub fn as_deps(&self) -> Option<&HashMap<String, Value>> {
        match self {
            NodeInput::Seed(_) => None,
            NodeInput::Deps(m) => Some(m),
        }
    }

    /// A single predecessor's result by id. Returns `None` for seed inputs and
    /// for predecessors that are absent (skipped or failed).
    pub fn dep(&self, node_id: &str) -> Option<&Value> {
        self.as_deps().and_then(|m| m.get(node_id))
    }
}

/// Shared context passed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the current execution run.
    pub execution_id: uuid::Uuid,
    /// Identifier threaded through every log/metric event for this execution.
    pub correlation_id: String,
    /// Cooperative cancellation signal. Long-running node implementations
    /// should poll this (or select against `cancelled()`) at safe points.
    pub cancellation: CancellationToken,
    /// Secrets scoped to this execution, available to capability adapters.
    pub secrets: HashMap<String, String>,
}

impl ExecutionContext {
    /// Build a fresh context with a random execution id and no secrets.
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4(),
            correlation_id: correlation_id.into(),
            cancellation: CancellationToken::new(),
            secrets: HashMap::new(),
        }
    }

    /// True if cancellation has been signalled for this execution.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// The core node trait.
///
/// All built-in nodes and plugin adapters must implement this.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node, receiving either the seed value or the predecessor
    /// result map as `input`, and return this node's output value.
    async fn execute(&self, input: NodeInput, ctx: &ExecutionContext) -> Result<Value, NodeError>;
}

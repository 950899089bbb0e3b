//! The DAG model: nodes, bidirectional edges, validation, and topological
//! ordering.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use nodes::ExecutableNode;

use crate::error::DagError;
use crate::observability::NodeMetrics;
use crate::retry::RetryPolicy;

pub type NodeId = String;

fn default_node_timeout() -> Duration {
    std::env::var("RAG_NODE_TIMEOUT")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(30_000))
}

/// Construction-time options for a node, passed to [`Dag::add_node`].
pub struct NodeOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_policy: Option<Arc<RetryPolicy>>,
    pub priority: i32,
    pub optional: bool,
    pub tags: Vec<String>,
    pub metadata: Value,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: None,
            retry_policy: None,
            priority: 0,
            optional: false,
            tags: Vec::new(),
            metadata: Value::Null,
        }
    }
}

/// A single unit of work in a [`Dag`].
///
/// A `Node` is never constructed without its `run` implementation attached —
/// there is no representable "node with no run function" in this model, so
/// that class of validation error from a dynamically-typed source is
/// eliminated by the type system instead of checked at runtime.
pub struct Node {
    pub id: NodeId,
    pub run: Arc<dyn ExecutableNode>,
    pub timeout: Duration,
    pub retries: Option<u32>,
    pub retry_policy: Option<Arc<RetryPolicy>>,
    pub priority: i32,
    pub optional: bool,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub metrics: NodeMetrics,
    inputs: HashSet<NodeId>,
    outputs: HashSet<NodeId>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("priority", &self.priority)
            .field("optional", &self.optional)
            .field("tags", &self.tags)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl Node {
    fn new(id: NodeId, run: Arc<dyn ExecutableNode>, options: NodeOptions) -> Self {
        Self {
            id,
            run,
            timeout: options.timeout.unwrap_or_else(default_node_timeout),
            retries: options.retries,
            retry_policy: options.retry_policy,
            priority: options.priority,
            optional: options.optional,
            tags: options.tags,
            metadata: options.metadata,
            metrics: NodeMetrics::default(),
            inputs: HashSet::new(),
            outputs: HashSet::new(),
        }
    }

    /// Predecessor ids, in no particular order.
    pub fn inputs(&self) -> impl Iterator<Item = &NodeId> {
        self.inputs.iter()
    }

    /// Successor ids, in no particular order.
    pub fn outputs(&self) -> impl Iterator<Item = &NodeId> {
        self.outputs.iter()
    }
}

/// A directed acyclic graph of [`Node`]s. Owns its nodes exclusively; a node
/// may not be shared between two `Dag`s.
#[derive(Default)]
pub struct Dag {
    nodes: HashMap<NodeId, Node>,
    insertion_order: Vec<NodeId>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a node. Rejects a duplicate id.
    pub fn add_node(
        &mut self,
        id: impl Into<String>,
        run: Arc<dyn ExecutableNode>,
        options: NodeOptions,
    ) -> Result<&Node, DagError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(DagError::DuplicateNodeId(id));
        }
        self.insertion_order.push(id.clone());
        let node = Node::new(id.clone(), run, options);
        self.nodes.insert(id.clone(), node);
        Ok(self.nodes.get(&id).expect("just inserted"))
    }

    /// Connect `from -> to`. Rejects unknown ids and self-loops, and keeps
    /// the `inputs`/`outputs` relation bidirectionally consistent.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if from == to {
            return Err(DagError::SelfLoop(from.to_string()));
        }
        if !self.nodes.contains_key(from) {
            return Err(DagError::UnknownNodeReference { node_id: from.to_string(), side: "from" });
        }
        if !self.nodes.contains_key(to) {
            return Err(DagError::UnknownNodeReference { node_id: to.to_string(), side: "to" });
        }
        self.nodes.get_mut(from).unwrap().outputs.insert(to.to_string());
        self.nodes.get_mut(to).unwrap().inputs.insert(from.to_string());
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes with no predecessors.
    pub fn sources(&self) -> Vec<NodeId> {
        self.insertion_order
            .iter()
            .filter(|id| self.nodes[*id].inputs.is_empty())
            .cloned()
            .collect()
    }

    /// Nodes with no successors.
    pub fn sinks(&self) -> Vec<NodeId> {
        self.insertion_order
            .iter()
            .filter(|id| self.nodes[*id].outputs.is_empty())
            .cloned()
            .collect()
    }

    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        self.nodes.get(id).map(|n| n.inputs.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn successors(&self, id: &str) -> Vec<NodeId> {
        self.nodes.get(id).map(|n| n.outputs.iter().cloned().collect()).unwrap_or_default()
    }

    /// Validate structural invariants and return the topological order.
    ///
    /// Uniqueness of ids, edge-endpoint existence, and absence of self-loops
    /// are already enforced incrementally by `add_node`/`connect`; this
    /// re-derives the topological order from scratch (catching cycles formed
    /// by any combination of edges) and rejects an empty graph.
    pub fn validate(&self) -> Result<Vec<NodeId>, DagError> {
        if self.nodes.is_empty() {
            return Err(DagError::Empty);
        }
        self.topological_order()
    }

    /// Kahn's-algorithm topological sort. Ties are broken by descending
    /// `priority`, then by insertion order, for determinism.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, DagError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(self.nodes.len());
        for (id, node) in &self.nodes {
            in_degree.insert(id.as_str(), node.inputs.len());
        }

        let index_of: HashMap<&str, usize> = self
            .insertion_order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        // (priority, Reverse(insertion_index)) — BinaryHeap is a max-heap, so
        // higher priority pops first; for equal priority, the smaller
        // insertion index (wrapped in Reverse) pops first.
        let mut ready: BinaryHeap<(i32, Reverse<usize>, String)> = BinaryHeap::new();
        for (id, &deg) in &in_degree {
            if deg == 0 {
                let node = &self.nodes[*id];
                ready.push((node.priority, Reverse(index_of[*id]), id.to_string()));
            }
        }

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some((_, _, id)) = ready.pop() {
            let node = &self.nodes[&id];
            for succ in &node.outputs {
                let deg = in_degree.get_mut(succ.as_str()).expect("successor must exist");
                *deg -= 1;
                if *deg == 0 {
                    let succ_node = &self.nodes[succ];
                    ready.push((succ_node.priority, Reverse(index_of[succ.as_str()]), succ.clone()));
                }
            }
            sorted.push(id);
        }

        if sorted.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .keys()
                .find(|id| !sorted.contains(id))
                .cloned()
                .unwrap_or_else(|| "<unknown>".to_string());
            return Err(DagError::CycleDetected(stuck));
        }

        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodes::mock::MockNode;
    use serde_json::json;

    fn node(name: &str) -> Arc<dyn ExecutableNode> {
        Arc::new(MockNode::returning(name, json!({})))
    }

    #[test]
    fn linear_dag_validates_and_sorts_correctly() {
        let mut dag = Dag::new();
        dag.add_node("a", node("a"), NodeOptions::default()).unwrap();
        dag.add_node("b", node("b"), NodeOptions::default()).unwrap();
        dag.add_node("c", node("c"), NodeOptions::default()).unwrap();
        dag.connect("a", "b").unwrap();
        dag.connect("b", "c").unwrap();

        let order = dag.validate().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_dag_orders_sources_before_sinks() {
        let mut dag = Dag::new();
        for id in ["a", "b", "c", "d"] {
            dag.add_node(id, node(id), NodeOptions::default()).unwrap();
        }
        dag.connect("a", "b").unwrap();
        dag.connect("a", "c").unwrap();
        dag.connect("b", "d").unwrap();
        dag.connect("c", "d").unwrap();

        let order = dag.validate().unwrap();
        assert_eq!(order.first().unwrap(), "a");
        assert_eq!(order.last().unwrap(), "d");
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node("a", node("a"), NodeOptions::default()).unwrap();
        let err = dag.add_node("a", node("a2"), NodeOptions::default()).unwrap_err();
        assert!(matches!(err, DagError::DuplicateNodeId(id) if id == "a"));
    }

    #[test]
    fn connect_rejects_unknown_endpoint() {
        let mut dag = Dag::new();
        dag.add_node("a", node("a"), NodeOptions::default()).unwrap();
        let err = dag.connect("a", "ghost").unwrap_err();
        assert!(matches!(err, DagError::UnknownNodeReference { node_id, .. } if node_id == "ghost"));
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node("a", node("a"), NodeOptions::default()).unwrap();
        let err = dag.connect("a", "a").unwrap_err();
        assert!(matches!(err, DagError::SelfLoop(id) if id == "a"));
    }

    #[test]
    fn cycle_is_detected() {
        let mut dag = Dag::new();
        for id in ["a", "b", "c"] {
            dag.add_node(id, node(id), NodeOptions::default()).unwrap();
        }
        dag.connect("a", "b").unwrap();
        dag.connect("b", "c").unwrap();
        dag.connect("c", "a").unwrap();

        assert!(matches!(dag.validate(), Err(DagError::CycleDetected(_))));
    }

    #[test]
    fn empty_dag_is_rejected() {
        let dag = Dag::new();
        assert!(matches!(dag.validate(), Err(DagError::Empty)));
    }

    #[test]
    fn single_node_no_edges_is_valid() {
        let mut dag = Dag::new();
        dag.add_node("solo", node("solo"), NodeOptions::default()).unwrap();
        assert_eq!(dag.validate().unwrap(), vec!["solo"]);
    }

    #[test]
    fn priority_breaks_ties_among_ready_nodes() {
        let mut dag = Dag::new();
        dag.add_node("low", node("low"), NodeOptions { priority: 0, ..Default::default() }).unwrap();
        dag.add_node("high", node("high"), NodeOptions { priority: 10, ..Default::default() }).unwrap();
        let order = dag.validate().unwrap();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[test]
    fn equal_priority_breaks_ties_by_insertion_order() {
        let mut dag = Dag::new();
        dag.add_node("first", node("first"), NodeOptions::default()).unwrap();
        dag.add_node("second", node("second"), NodeOptions::default()).unwrap();
        let order = dag.validate().unwrap();
        assert_eq!(order, vec!["first", "second"]);
    }
}

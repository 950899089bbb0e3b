//! `rag-workflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — validate a workflow JSON file's DAG structure.
//! - `run`      — execute a workflow JSON file's DAG and print the report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{execute, Dag, DagError, ExecutionOptions, NodeOptions};
use nodes::mock::MockNode;

#[derive(Parser)]
#[command(name = "rag-workflow-engine", about = "Concurrent DAG execution core for RAG pipelines", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file's DAG structure.
    Validate {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
    /// Execute a workflow definition JSON file and print the execution report.
    Run {
        /// Path to the workflow JSON file.
        path: std::path::PathBuf,
    },
}

/// On-disk shape of a demo workflow: nodes carry a fixed JSON output (echoed
/// via `MockNode`), so this crate can drive the real scheduler over
/// arbitrary graphs without requiring a compiled-in node implementation per
/// workflow.
#[derive(Debug, Deserialize)]
struct WorkflowSpec {
    nodes: Vec<NodeSpec>,
    #[serde(default)]
    edges: Vec<(String, String)>,
    #[serde(default)]
    seed: Value,
    #[serde(default)]
    options: OptionsSpec,
}

#[derive(Debug, Deserialize)]
struct NodeSpec {
    id: String,
    #[serde(default)]
    output: Value,
    timeout_ms: Option<u64>,
    retries: Option<u32>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Default, Deserialize)]
struct OptionsSpec {
    concurrency: Option<usize>,
    #[serde(default)]
    continue_on_error: bool,
    #[serde(default)]
    graceful_degradation: bool,
    timeout_ms: Option<u64>,
    #[serde(default)]
    required_nodes: Vec<String>,
}

fn build_dag(spec: &WorkflowSpec) -> Result<Dag, DagError> {
    let mut dag = Dag::new();
    for node in &spec.nodes {
        let run = Arc::new(MockNode::returning(node.id.clone(), node.output.clone()));
        let options = NodeOptions {
            timeout: node.timeout_ms.map(Duration::from_millis),
            retries: node.retries,
            priority: node.priority,
            optional: node.optional,
            ..NodeOptions::default()
        };
        dag.add_node(node.id.clone(), run, options)?;
    }
    for (from, to) in &spec.edges {
        dag.connect(from, to)?;
    }
    Ok(dag)
}

fn load_spec(path: &std::path::Path) -> WorkflowSpec {
    let content = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("cannot read file {}: {e}", path.display()));
    serde_json::from_str(&content).unwrap_or_else(|e| panic!("invalid workflow JSON: {e}"))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let is_production = std::env::var("APP_ENV")
        .or_else(|_| std::env::var("NODE_ENV"))
        .map(|v| v == "production")
        .unwrap_or(false);

    if is_production {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let spec = load_spec(&path);
            let dag = build_dag(&spec).unwrap_or_else(|e| {
                eprintln!("invalid workflow structure: {e}");
                std::process::exit(1);
            });

            match dag.validate() {
                Ok(order) => println!("workflow is valid. execution order: {order:?}"),
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Command::Run { path } => {
            let spec = load_spec(&path);
            let dag = build_dag(&spec).unwrap_or_else(|e| {
                eprintln!("invalid workflow structure: {e}");
                std::process::exit(1);
            });

            let mut required_nodes: HashSet<String> = HashSet::new();
            required_nodes.extend(spec.options.required_nodes.iter().cloned());

            let options = ExecutionOptions {
                timeout: spec.options.timeout_ms.map(Duration::from_millis),
                concurrency: spec
                    .options
                    .concurrency
                    .unwrap_or_else(|| std::env::var("RAG_MAX_CONCURRENCY").ok().and_then(|s| s.parse().ok()).unwrap_or(5)),
                continue_on_error: spec.options.continue_on_error,
                graceful_degradation: spec.options.graceful_degradation,
                required_nodes,
                retry_policy: None,
                correlation_id: None,
            };

            info!(nodes = dag.len(), "starting execution");
            let report = execute(&dag, spec.seed, options, None).await.unwrap_or_else(|e| {
                eprintln!("execution rejected: {e}");
                std::process::exit(1);
            });

            let results: HashMap<&str, &Value> = report.results.iter().map(|(k, v)| (k.as_str(), v)).collect();
            let failures: Vec<Value> = report
                .failures
                .iter()
                .map(|f| json!({"node_id": f.node_id, "error": f.error.to_string(), "required": f.required}))
                .collect();

            let output = json!({
                "execution_id": report.execution_id.to_string(),
                "correlation_id": report.correlation_id,
                "success": report.summary.success,
                "results": results,
                "failures": failures,
                "summary": {
                    "nodes_total": report.summary.nodes_total,
                    "nodes_succeeded": report.summary.nodes_succeeded,
                    "nodes_skipped": report.summary.nodes_skipped,
                    "nodes_failed": report.summary.nodes_failed,
                    "nodes_blocked": report.summary.nodes_blocked,
                    "duration_ms": report.summary.duration.as_millis(),
                },
            });

            println!("{}", serde_json::to_string_pretty(&output).expect("report serializes"));
            if !report.summary.success {
                std::process::exit(1);
            }
        }
    }
}

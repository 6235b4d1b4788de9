// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Graph builders, a scripted worker keyed by iteration, and executor setup

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use phaseflow::contract::{ContractSpec, SharedRegistry};
use phaseflow::engine::{ArtifactRef, NodeOutput, NodeRequest, NodeWorker, WorkflowExecutor};
use phaseflow::graph::{Node, Phase, RetryPolicy, WorkflowGraph};
use phaseflow::quality::QualityMetrics;
use phaseflow::store::StateStore;

/// Worker whose answers are scripted per node, per phase iteration
#[derive(Default)]
pub struct ScriptedWorker {
    /// (node, iteration) -> output; iteration 0 means "any iteration"
    script: Mutex<HashMap<(String, u32), NodeOutput>>,
    /// (node, attempt) -> failure message, consulted before the script
    failing_attempts: Mutex<HashMap<(String, u32), String>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<CallRecord>>,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub node_id: String,
    pub iteration: u32,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_nodes: Vec<String>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, node_id: &str, iteration: u32, output: NodeOutput) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert((node_id.to_string(), iteration), output);
        self
    }

    pub fn always(self, node_id: &str, output: NodeOutput) -> Self {
        self.on(node_id, 0, output)
    }

    pub fn fail_attempt(self, node_id: &str, attempt: u32) -> Self {
        self.failing_attempts
            .lock()
            .unwrap()
            .insert((node_id.to_string(), attempt), "transient".to_string());
        self
    }

    pub fn with_delay(self, node_id: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(node_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, node_id: &str) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|c| c.node_id == node_id)
            .collect()
    }

    fn answer(&self, request: &NodeRequest) -> NodeOutput {
        let key = (request.node_id.clone(), request.attempt);
        if let Some(message) = self.failing_attempts.lock().unwrap().get(&key) {
            return NodeOutput::failure(message);
        }

        let script = self.script.lock().unwrap();
        script
            .get(&(request.node_id.clone(), request.iteration))
            .or_else(|| script.get(&(request.node_id.clone(), 0)))
            .cloned()
            .unwrap_or_else(|| {
                NodeOutput::success()
                    .with_metrics(QualityMetrics::new(1.0, 1.0, 1.0))
                    .with_artifact(ArtifactRef::new(
                        &request.node_id,
                        &format!("mem://{}/{}", request.node_id, request.iteration),
                    ))
            })
    }
}

#[async_trait]
impl NodeWorker for ScriptedWorker {
    async fn execute_node(&self, request: NodeRequest) -> NodeOutput {
        let started_at = Utc::now();
        let delay = self.delays.lock().unwrap().get(&request.node_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let output = self.answer(&request);

        let mut input_nodes: Vec<String> = request.inputs.keys().cloned().collect();
        input_nodes.sort();
        self.calls.lock().unwrap().push(CallRecord {
            node_id: request.node_id.clone(),
            iteration: request.iteration,
            attempt: request.attempt,
            started_at,
            finished_at: Utc::now(),
            input_nodes,
        });

        output
    }
}

pub fn metrics(completeness: f64, quality: f64, test_coverage: f64) -> NodeOutput {
    NodeOutput::success().with_metrics(QualityMetrics::new(completeness, quality, test_coverage))
}

pub fn executor(worker: Arc<ScriptedWorker>) -> WorkflowExecutor {
    WorkflowExecutor::builder(worker).build()
}

pub fn executor_with_store(
    worker: Arc<ScriptedWorker>,
    store: Arc<dyn StateStore>,
    contracts: SharedRegistry,
) -> WorkflowExecutor {
    WorkflowExecutor::builder(worker)
        .with_store(store)
        .with_contracts(contracts)
        .build()
}

/// Interface (locks `api`) -> builder (consumes `api`) -> review checkpoint,
/// all in the Implementation phase
pub fn implementation_graph() -> WorkflowGraph {
    WorkflowGraph::new("implementation")
        .with_node(
            "api",
            Node::interface().in_phase(Phase::Implementation).locks("api"),
        )
        .with_node(
            "build",
            Node::action()
                .in_phase(Phase::Implementation)
                .consumes("api")
                .depends_on(["api"]),
        )
        .with_node(
            "review",
            Node::checkpoint()
                .in_phase(Phase::Implementation)
                .depends_on(["build"]),
        )
}

pub fn api_contract() -> ContractSpec {
    ContractSpec::new(
        "api",
        "openapi",
        "api",
        serde_json::json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        }),
    )
}

/// Linear chain n1 -> n2 -> ... of plain action nodes
pub fn chain(len: usize) -> WorkflowGraph {
    let mut graph = WorkflowGraph::new("chain");
    for i in 1..=len {
        let mut node = Node::action();
        if i > 1 {
            node = node.depends_on([format!("n{}", i - 1)]);
        }
        graph = graph.with_node(&format!("n{}", i), node);
    }
    graph
}

pub fn quick_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed_delay(max_attempts, Duration::from_millis(5))
}

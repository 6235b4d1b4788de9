// ABOUTME: Resumable run state: per-node execution records and phase history
// ABOUTME: Everything needed to resume a run in another process lives here

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::machine::{transition, NodeEvent, TransitionError};
use crate::contract::ProducerLedger;
use crate::gate::{PhaseOutcome, Verdict};
use crate::graph::{Phase, WorkflowGraph};
use crate::quality::QualityMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NodeStatus::Pending => "PENDING",
            NodeStatus::Ready => "READY",
            NodeStatus::Running => "RUNNING",
            NodeStatus::Succeeded => "SUCCEEDED",
            NodeStatus::Failed => "FAILED",
            NodeStatus::Skipped => "SKIPPED",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Paused,
    Cancelled,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled | RunStatus::Succeeded | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        };
        write!(f, "{}", label)
    }
}

/// Reference to something a node produced; the core never opens it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub location: String,
}

impl ArtifactRef {
    pub fn new(name: &str, location: &str) -> Self {
        Self {
            name: name.to_string(),
            location: location.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    pub metrics: Option<QualityMetrics>,
    pub error: Option<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    pub fn new() -> Self {
        Self {
            status: NodeStatus::Pending,
            attempts: 0,
            history: Vec::new(),
            artifacts: Vec::new(),
            metrics: None,
            error: None,
            ready_at: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Drive the node state machine and stamp the transition time
    pub fn apply(&mut self, event: NodeEvent) -> Result<NodeStatus, TransitionError> {
        let next = transition(self.status, event)?;
        let now = Utc::now();

        match event {
            NodeEvent::MarkReady => self.ready_at = Some(now),
            NodeEvent::Start => {
                self.attempts += 1;
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            NodeEvent::Succeed
            | NodeEvent::Fail { retry: false }
            | NodeEvent::Skip
            | NodeEvent::Abort => self.finished_at = Some(now),
            NodeEvent::Fail { retry: true } => {}
            NodeEvent::Reset => {
                self.ready_at = None;
                self.finished_at = None;
                self.error = None;
                self.metrics = None;
            }
        }

        self.status = next;
        Ok(next)
    }
}

impl Default for NodeExecution {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Exit gate returned FAIL
    Gate,
    /// Entry gate blocked every remaining node
    Entry,
    /// A node failed outside any gated phase
    Node,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub phase: Option<Phase>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunState {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub nodes: IndexMap<String, NodeExecution>,
    #[serde(default)]
    pub outcomes: Vec<PhaseOutcome>,
    #[serde(default)]
    pub iterations: BTreeMap<Phase, u32>,
    /// Phases with a boundary node in the submitted graph
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// Phases whose entry gate has already passed
    #[serde(default)]
    pub entered_phases: BTreeSet<Phase>,
    pub failure: Option<RunFailure>,
    #[serde(default)]
    pub wave_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRunState {
    pub fn new(run_id: &str, graph: &WorkflowGraph) -> Self {
        let now = Utc::now();
        let phases = graph.phases();

        Self {
            run_id: run_id.to_string(),
            graph_id: graph.id.clone(),
            status: RunStatus::Running,
            nodes: graph
                .nodes
                .keys()
                .map(|id| (id.clone(), NodeExecution::new()))
                .collect(),
            outcomes: Vec::new(),
            iterations: phases.iter().map(|phase| (*phase, 1)).collect(),
            phases,
            entered_phases: BTreeSet::new(),
            failure: None,
            wave_count: 0,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.get(node_id)
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.nodes.get(node_id).map(|n| n.status)
    }

    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    pub fn all_terminal(&self) -> bool {
        self.nodes.values().all(|n| n.status.is_terminal())
    }

    /// Current iteration for a phase; phases start at 1
    pub fn iteration(&self, phase: Phase) -> u32 {
        self.iterations.get(&phase).copied().unwrap_or(1)
    }

    pub fn latest_outcome(&self, phase: Phase) -> Option<&PhaseOutcome> {
        self.outcomes.iter().rev().find(|o| o.phase == phase)
    }

    pub fn outcomes_for(&self, phase: Phase) -> Vec<&PhaseOutcome> {
        self.outcomes.iter().filter(|o| o.phase == phase).collect()
    }

    pub fn phase_passed(&self, phase: Phase) -> bool {
        self.latest_outcome(phase)
            .is_some_and(|o| o.verdict == Verdict::Pass)
    }

    /// Metrics of every exit evaluation of a phase, oldest first
    pub fn metric_history(&self, phase: Phase) -> Vec<QualityMetrics> {
        self.outcomes_for(phase)
            .into_iter()
            .filter_map(|o| o.metrics)
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn finish(&mut self, status: RunStatus) {
        let now = Utc::now();
        self.status = status;
        self.updated_at = now;
        self.finished_at = Some(now);
    }
}

impl ProducerLedger for WorkflowRunState {
    fn has_succeeded(&self, node_id: &str) -> bool {
        self.node_status(node_id) == Some(NodeStatus::Succeeded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    fn sample_graph() -> WorkflowGraph {
        WorkflowGraph::new("sample")
            .with_node("spec", Node::interface().in_phase(Phase::Design))
            .with_node(
                "review",
                Node::checkpoint().in_phase(Phase::Design).depends_on(["spec"]),
            )
            .with_node("build", Node::action().depends_on(["review"]))
    }

    #[test]
    fn test_new_run_state() {
        let state = WorkflowRunState::new("run-1", &sample_graph());

        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.count(NodeStatus::Pending), 3);
        assert_eq!(state.phases, vec![Phase::Design]);
        assert_eq!(state.iteration(Phase::Design), 1);
        assert_eq!(state.iteration(Phase::Testing), 1);
        assert!(!state.all_terminal());
        assert!(!state.phase_passed(Phase::Design));
    }

    #[test]
    fn test_node_execution_stamps_transitions() {
        let mut node = NodeExecution::new();
        node.apply(NodeEvent::MarkReady).unwrap();
        node.apply(NodeEvent::Start).unwrap();
        assert_eq!(node.attempts, 1);
        assert!(node.started_at.is_some());

        node.apply(NodeEvent::Fail { retry: true }).unwrap();
        assert_eq!(node.status, NodeStatus::Ready);
        assert!(node.finished_at.is_none());

        node.apply(NodeEvent::Start).unwrap();
        node.apply(NodeEvent::Succeed).unwrap();
        assert_eq!(node.attempts, 2);
        assert!(node.finished_at.is_some());

        node.apply(NodeEvent::Reset).unwrap();
        assert_eq!(node.status, NodeStatus::Pending);
        assert!(node.finished_at.is_none());
    }

    #[test]
    fn test_producer_ledger() {
        let mut state = WorkflowRunState::new("run-1", &sample_graph());
        assert!(!state.has_succeeded("spec"));

        let spec = state.nodes.get_mut("spec").unwrap();
        spec.apply(NodeEvent::MarkReady).unwrap();
        spec.apply(NodeEvent::Start).unwrap();
        spec.apply(NodeEvent::Succeed).unwrap();

        assert!(state.has_succeeded("spec"));
        assert!(!state.has_succeeded("missing"));
    }

    #[test]
    fn test_state_serializes_to_json() {
        let state = WorkflowRunState::new("run-1", &sample_graph());
        let json = serde_json::to_string_pretty(&state).unwrap();
        assert!(json.contains("\"PENDING\""));

        let restored: WorkflowRunState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}

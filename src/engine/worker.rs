// ABOUTME: Interfaces to the external collaborators that perform node work
// ABOUTME: NodeWorker executes a node; CapabilityRouter optionally ranks executors

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::state::ArtifactRef;
use crate::graph::{CapabilityTag, NodeKind, Phase};
use crate::quality::QualityMetrics;

/// What a worker is told about the node it is asked to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub run_id: String,
    pub node_id: String,
    pub kind: NodeKind,
    pub phase: Option<Phase>,
    /// Current iteration of the node's phase, 1 when the node has none
    pub iteration: u32,
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Artifacts of every direct upstream dependency, keyed by node id
    pub inputs: HashMap<String, Vec<ArtifactRef>>,
    pub capability_hint: CapabilityHint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityHint {
    /// Executor identities ranked by a router
    Ranked(Vec<String>),
    /// Raw tags passed through when no router is configured
    Tags(Vec<CapabilityTag>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Left empty by nodes that do not score the phase
    #[serde(default)]
    pub metrics: Option<QualityMetrics>,
    pub error: Option<String>,
}

impl NodeOutput {
    pub fn success() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn with_metrics(mut self, metrics: QualityMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Performs the actual work of a node. May be called again for the same
/// node on retry or rework; side effects are not deduplicated.
#[async_trait]
pub trait NodeWorker: Send + Sync {
    async fn execute_node(&self, request: NodeRequest) -> NodeOutput;
}

#[async_trait]
pub trait CapabilityRouter: Send + Sync {
    async fn rank_candidates(&self, tags: &[CapabilityTag]) -> Vec<String>;
}

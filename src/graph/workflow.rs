// ABOUTME: Workflow graph structure and YAML loading
// ABOUTME: Nodes keyed by id in declaration order with phase and contract lookups

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tokio::fs;

use super::error::{GraphError, Result};
use super::node::{Node, Phase};

fn default_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    pub nodes: IndexMap<String, Node>,
}

impl WorkflowGraph {
    pub fn new(name: &str) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            description: None,
            version: default_version(),
            nodes: IndexMap::new(),
        }
    }

    pub fn with_node(mut self, id: &str, node: Node) -> Self {
        self.nodes.insert(id.to_string(), node);
        self
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let mut graph: WorkflowGraph = serde_yaml::from_str(content)?;

        if graph.name.trim().is_empty() {
            return Err(GraphError::MissingField("name".to_string()));
        }
        if graph.id.trim().is_empty() {
            graph.id = graph.name.clone();
        }

        for (node_id, node) in &mut graph.nodes {
            if node.name.is_none() {
                node.name = Some(node_id.clone());
            }
        }

        Ok(graph)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Phases declared by a boundary node, in prerequisite order
    pub fn phases(&self) -> Vec<Phase> {
        let phases: BTreeSet<Phase> = self
            .nodes
            .values()
            .filter(|node| node.is_boundary())
            .filter_map(|node| node.phase)
            .collect();
        phases.into_iter().collect()
    }

    pub fn boundary_for(&self, phase: Phase) -> Option<&str> {
        self.nodes
            .iter()
            .find(|(_, node)| node.is_boundary() && node.phase == Some(phase))
            .map(|(id, _)| id.as_str())
    }

    /// The phase's node set, excluding its boundary node
    pub fn members_of(&self, phase: Phase) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.phase == Some(phase) && !node.is_boundary())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn contracts_locked_by_phase(&self, phase: Phase) -> Vec<String> {
        self.nodes
            .values()
            .filter(|node| node.phase == Some(phase))
            .filter_map(|node| node.locks_contract.clone())
            .collect()
    }

    pub fn contracts_consumed_by_phase(&self, phase: Phase) -> Vec<String> {
        let consumed: BTreeSet<String> = self
            .nodes
            .values()
            .filter(|node| node.phase == Some(phase))
            .flat_map(|node| node.consumes_contracts.iter().cloned())
            .collect();
        consumed.into_iter().collect()
    }
}

pub struct GraphParser;

impl GraphParser {
    pub fn new() -> Self {
        Self
    }

    pub async fn parse_file<P: AsRef<Path>>(&self, path: P) -> Result<WorkflowGraph> {
        let content = fs::read_to_string(path.as_ref()).await?;
        self.parse_string(&content)
    }

    pub fn parse_string(&self, content: &str) -> Result<WorkflowGraph> {
        WorkflowGraph::from_yaml(content)
    }
}

impl Default for GraphParser {
    fn default() -> Self {
        Self::new()
    }
}

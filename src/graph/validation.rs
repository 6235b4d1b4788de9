// ABOUTME: Submission-time validation of workflow graphs
// ABOUTME: Rejects cycles, dangling edges and malformed nodes before anything is scheduled

use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;
use petgraph::Graph;
use std::collections::{BTreeMap, HashMap, HashSet};

use super::error::GraphValidationError;
use super::node::{Node, Phase};
use super::workflow::WorkflowGraph;

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<GraphValidationError>,
    pub warnings: Vec<String>,
    pub is_valid: bool,
}

pub struct GraphValidator;

impl GraphValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, graph: &WorkflowGraph) -> ValidationReport {
        let mut report = ValidationReport::new();

        if graph.nodes.is_empty() {
            report.errors.push(GraphValidationError::EmptyGraph);
            report.is_valid = false;
            return report;
        }

        self.validate_dependencies(graph, &mut report);
        self.detect_cycles(graph, &mut report);
        self.validate_node_configs(graph, &mut report);
        self.validate_boundaries(graph, &mut report);
        self.check_contract_references(graph, &mut report);

        report.is_valid = report.errors.is_empty();
        report
    }

    fn validate_dependencies(&self, graph: &WorkflowGraph, report: &mut ValidationReport) {
        for (node_id, node) in &graph.nodes {
            for dep in &node.depends_on {
                if dep == node_id {
                    report.errors.push(GraphValidationError::SelfDependency {
                        node: node_id.clone(),
                    });
                } else if !graph.nodes.contains_key(dep) {
                    report.errors.push(GraphValidationError::UnknownDependency {
                        node: node_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
    }

    fn detect_cycles(&self, graph: &WorkflowGraph, report: &mut ValidationReport) {
        let mut petgraph: Graph<String, ()> = Graph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for node_id in graph.nodes.keys() {
            indices.insert(node_id.as_str(), petgraph.add_node(node_id.clone()));
        }

        for (node_id, node) in &graph.nodes {
            for dep in &node.depends_on {
                // self edges and dangling edges are reported separately
                if dep == node_id {
                    continue;
                }
                if let Some(&dep_idx) = indices.get(dep.as_str()) {
                    petgraph.add_edge(dep_idx, indices[node_id.as_str()], ());
                }
            }
        }

        for component in tarjan_scc(&petgraph) {
            if component.len() > 1 {
                let mut nodes: Vec<String> =
                    component.iter().map(|idx| petgraph[*idx].clone()).collect();
                nodes.sort();
                report
                    .errors
                    .push(GraphValidationError::CircularDependency { nodes });
            }
        }
    }

    fn validate_node_configs(&self, graph: &WorkflowGraph, report: &mut ValidationReport) {
        for (node_id, node) in &graph.nodes {
            if let Err(error) = self.validate_single_node(node_id, node) {
                report.errors.push(error);
            }

            if node.kind.is_boundary() && node.phase.is_none() {
                report.warnings.push(format!(
                    "Node '{}' is a {} without a phase and will not trigger a gate",
                    node_id, node.kind
                ));
            }
        }
    }

    fn validate_single_node(&self, node_id: &str, node: &Node) -> Result<(), GraphValidationError> {
        if let Some(ref retry) = node.retry_policy {
            if retry.max_attempts == 0 {
                return Err(GraphValidationError::InvalidNodeConfig {
                    node: node_id.to_string(),
                    reason: "max_attempts must be greater than 0".to_string(),
                });
            }

            if !retry.backoff_multiplier.is_finite() || retry.backoff_multiplier < 1.0 {
                return Err(GraphValidationError::InvalidNodeConfig {
                    node: node_id.to_string(),
                    reason: "backoff_multiplier must be a finite number of at least 1.0".to_string(),
                });
            }
        }

        if node.timeout.is_some_and(|t| t.is_zero()) {
            return Err(GraphValidationError::InvalidNodeConfig {
                node: node_id.to_string(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    fn validate_boundaries(&self, graph: &WorkflowGraph, report: &mut ValidationReport) {
        let mut boundaries: BTreeMap<Phase, Vec<String>> = BTreeMap::new();
        for (node_id, node) in &graph.nodes {
            if let (true, Some(phase)) = (node.is_boundary(), node.phase) {
                boundaries.entry(phase).or_default().push(node_id.clone());
            }
        }

        for (phase, nodes) in boundaries {
            if nodes.len() > 1 {
                report
                    .errors
                    .push(GraphValidationError::DuplicateBoundary { phase, nodes });
            }
        }
    }

    fn check_contract_references(&self, graph: &WorkflowGraph, report: &mut ValidationReport) {
        let mut lockers: HashMap<&str, Vec<&str>> = HashMap::new();
        for (node_id, node) in &graph.nodes {
            if let Some(ref contract) = node.locks_contract {
                lockers.entry(contract.as_str()).or_default().push(node_id);
            }
        }

        for (contract, nodes) in &lockers {
            if nodes.len() > 1 {
                report.errors.push(GraphValidationError::InvalidNodeConfig {
                    node: nodes[1].to_string(),
                    reason: format!("contract '{}' is already locked by '{}'", contract, nodes[0]),
                });
            }
        }

        let mut warned = HashSet::new();
        for (node_id, node) in &graph.nodes {
            for contract in &node.consumes_contracts {
                if !lockers.contains_key(contract.as_str()) && warned.insert(contract.clone()) {
                    report.warnings.push(format!(
                        "Node '{}' consumes contract '{}' which no node in this graph locks",
                        node_id, contract
                    ));
                }
            }
        }
    }
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            is_valid: true,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Collapse the report into the single error raised at submission
    pub fn into_result(mut self) -> Result<Vec<String>, GraphValidationError> {
        match self.errors.len() {
            0 => Ok(self.warnings),
            1 => Err(self.errors.remove(0)),
            _ => Err(GraphValidationError::Multiple {
                errors: self.errors,
            }),
        }
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

// ABOUTME: Error types for workflow graph loading and submission validation
// ABOUTME: Separates file/format failures from structural graph rejections

use thiserror::Error;

use super::node::Phase;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Failed to read graph file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Graph validation failed: {0}")]
    Validation(#[from] GraphValidationError),
}

/// Structural problems that make a graph unschedulable. Raised at
/// submission and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphValidationError {
    #[error("Empty graph: no nodes defined")]
    EmptyGraph,

    #[error("Circular dependency detected between nodes: {nodes:?}")]
    CircularDependency { nodes: Vec<String> },

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Node '{node}' depends on itself")]
    SelfDependency { node: String },

    #[error("Phase '{phase}' has more than one boundary node: {nodes:?}")]
    DuplicateBoundary { phase: Phase, nodes: Vec<String> },

    #[error("Invalid configuration for node '{node}': {reason}")]
    InvalidNodeConfig { node: String, reason: String },

    #[error("Graph rejected with {} errors: {}", errors.len(), join_errors(errors))]
    Multiple { errors: Vec<GraphValidationError> },
}

fn join_errors(errors: &[GraphValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, GraphError>;

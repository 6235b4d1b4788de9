// ABOUTME: Workflow graph model, YAML loading and submission validation
// ABOUTME: Exports nodes, phases, retry policies and the graph validator

pub mod error;
pub mod node;
pub mod validation;
pub mod workflow;

pub use error::{GraphError, GraphValidationError};
pub use node::{CapabilityTag, Node, NodeKind, Phase, RetryPolicy};
pub use validation::{GraphValidator, ValidationReport};
pub use workflow::{GraphParser, WorkflowGraph};

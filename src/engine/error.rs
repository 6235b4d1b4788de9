// ABOUTME: Error types for the workflow executor
// ABOUTME: Terminal run failures carry the full run state for diagnosis

use std::time::Duration;
use thiserror::Error;

use super::machine::TransitionError;
use super::state::{RunStatus, WorkflowRunState};
use crate::contract::ContractError;
use crate::graph::{GraphValidationError, Phase};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Graph rejected: {0}")]
    GraphValidation(#[from] GraphValidationError),

    #[error("Phase {phase} blocked: {reason}")]
    GateBlocked {
        phase: Phase,
        reason: String,
        state: Box<WorkflowRunState>,
    },

    #[error("Run {run_id} failed: {reason}")]
    RunFailed {
        run_id: String,
        reason: String,
        state: Box<WorkflowRunState>,
    },

    #[error("Contract conflict: {0}")]
    ContractConflict(#[from] ContractError),

    #[error("Persistence failed, run paused: {0}")]
    Persistence(#[from] StoreError),

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} has no node {node_id}")]
    UnknownNode { run_id: String, node_id: String },

    #[error("Run {run_id} is {status}; cannot {action}")]
    InvalidRunState {
        run_id: String,
        status: RunStatus,
        action: String,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl EngineError {
    /// Run state attached to a terminal failure
    pub fn run_state(&self) -> Option<&WorkflowRunState> {
        match self {
            EngineError::GateBlocked { state, .. } | EngineError::RunFailed { state, .. } => {
                Some(state.as_ref())
            }
            _ => None,
        }
    }
}

/// Why a single attempt at a node failed. Retried per the node's policy.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeExecutionError {
    #[error("Node {node_id} failed: {message}")]
    Failed { node_id: String, message: String },

    #[error("Node {node_id} timed out after {timeout:?}")]
    Timeout { node_id: String, timeout: Duration },

    #[error("Node {node_id} worker panicked: {message}")]
    Panicked { node_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, EngineError>;

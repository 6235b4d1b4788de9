// ABOUTME: Pure per-node state machine driving retry and rework control flow
// ABOUTME: transition(status, event) is side-effect free and unit-testable on its own

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::state::NodeStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEvent {
    /// Every upstream dependency succeeded
    MarkReady,
    Start,
    Succeed,
    /// `retry` is true while attempts remain
    Fail { retry: bool },
    /// Upstream failed terminally
    Skip,
    /// Phase failed or run cancelled around a node that had not finished
    Abort,
    /// Rework, forced re-run or contract re-validation
    Reset,
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::MarkReady => write!(f, "mark_ready"),
            NodeEvent::Start => write!(f, "start"),
            NodeEvent::Succeed => write!(f, "succeed"),
            NodeEvent::Fail { retry: true } => write!(f, "fail(retry)"),
            NodeEvent::Fail { retry: false } => write!(f, "fail"),
            NodeEvent::Skip => write!(f, "skip"),
            NodeEvent::Abort => write!(f, "abort"),
            NodeEvent::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid node transition: {event} from {from}")]
pub struct TransitionError {
    pub from: NodeStatus,
    pub event: NodeEvent,
}

pub fn transition(from: NodeStatus, event: NodeEvent) -> Result<NodeStatus, TransitionError> {
    use NodeEvent::*;
    use NodeStatus::*;

    let next = match (from, event) {
        (Pending, MarkReady) => Ready,
        (Ready, Start) => Running,
        (Running, Succeed) => Succeeded,
        (Running, Fail { retry: true }) => Ready,
        (Running, Fail { retry: false }) => Failed,
        (Pending | Ready, Skip) => Skipped,
        (Pending | Ready | Running, Abort) => Failed,
        (_, Reset) => Pending,
        _ => return Err(TransitionError { from, event }),
    };

    Ok(next)
}

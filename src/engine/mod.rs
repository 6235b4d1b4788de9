// ABOUTME: Workflow execution engine for phaseflow
// ABOUTME: Dependency resolution, wave scheduling, node state machine and run state

pub mod dependency;
pub mod error;
pub mod executor;
pub mod machine;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use dependency::{DependencyGraph, ExecutionPlan};
pub use error::{EngineError, NodeExecutionError, Result};
pub use executor::{ExecutorBuilder, WaveResult, WorkflowExecutor, DEFAULT_NODE_TIMEOUT};
pub use machine::{transition, NodeEvent, TransitionError};
pub use scheduler::{DispatchTask, NodeRunReport, WaveScheduler};
pub use state::{
    ArtifactRef, AttemptOutcome, AttemptRecord, FailureKind, NodeExecution, NodeStatus,
    RunFailure, RunStatus, WorkflowRunState,
};
pub use worker::{CapabilityHint, CapabilityRouter, NodeOutput, NodeRequest, NodeWorker};

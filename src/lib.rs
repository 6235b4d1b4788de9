// ABOUTME: Main library module for the phaseflow workflow engine
// ABOUTME: Exports all core modules and provides the public API

pub mod cli;
pub mod contract;
pub mod engine;
pub mod gate;
pub mod graph;
pub mod quality;
pub mod store;

// Re-export commonly used types
pub use contract::{Contract, ContractRegistry, ContractSpec, ContractStatus, SharedRegistry};
pub use engine::{
    EngineError, NodeOutput, NodeRequest, NodeStatus, NodeWorker, RunStatus, WaveResult,
    WorkflowExecutor, WorkflowRunState,
};
pub use gate::{GateResult, PhaseGateValidator, PhaseOutcome, Verdict};
pub use graph::{GraphValidator, Node, NodeKind, Phase, WorkflowGraph};
pub use quality::{ProgressiveQualityManager, QualityConfig, QualityMetrics};
pub use store::{JsonFileStore, MemoryStore, StateStore};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

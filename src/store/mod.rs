// ABOUTME: Durable storage for submitted graphs and resumable run state
// ABOUTME: StateStore trait with JSON-file and in-memory implementations

pub mod error;
pub mod json;
pub mod memory;

use async_trait::async_trait;

use crate::engine::WorkflowRunState;
use crate::graph::WorkflowGraph;

pub use error::{Result, StoreError};
pub use json::JsonFileStore;
pub use memory::MemoryStore;

/// Persistence for graph snapshots and run state. A stored run plus its
/// graph is enough to resume in a different process.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<()>;

    async fn load_graph(&self, graph_id: &str) -> Result<WorkflowGraph>;

    /// Replace the stored state of a run
    async fn save_run(&self, state: &WorkflowRunState) -> Result<()>;

    async fn load_run(&self, run_id: &str) -> Result<WorkflowRunState>;

    /// Stored run ids, sorted
    async fn list_runs(&self) -> Result<Vec<String>>;
}

// ABOUTME: In-process state store used by default and in tests
// ABOUTME: Can be told to reject writes to exercise the persistence-failure path

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::error::{Result, StoreError};
use super::StateStore;
use crate::engine::WorkflowRunState;
use crate::graph::WorkflowGraph;

#[derive(Debug, Default)]
pub struct MemoryStore {
    graphs: RwLock<HashMap<String, WorkflowGraph>>,
    runs: RwLock<HashMap<String, WorkflowRunState>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self, id: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected { id: id.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<()> {
        self.check_writable(&graph.id)?;
        self.graphs
            .write()
            .await
            .insert(graph.id.clone(), graph.clone());
        Ok(())
    }

    async fn load_graph(&self, graph_id: &str) -> Result<WorkflowGraph> {
        self.graphs
            .read()
            .await
            .get(graph_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Graph".to_string(),
                id: graph_id.to_string(),
            })
    }

    async fn save_run(&self, state: &WorkflowRunState) -> Result<()> {
        self.check_writable(&state.run_id)?;
        self.runs
            .write()
            .await
            .insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &str) -> Result<WorkflowRunState> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Run".to_string(),
                id: run_id.to_string(),
            })
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let mut runs: Vec<String> = self.runs.read().await.keys().cloned().collect();
        runs.sort();
        Ok(runs)
    }
}

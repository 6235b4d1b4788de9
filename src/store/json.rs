// ABOUTME: JSON file store laid out as <root>/graphs and <root>/runs
// ABOUTME: Writes go to a temp file first and are renamed into place

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::error::{Result, StoreError};
use super::StateStore;
use crate::engine::WorkflowRunState;
use crate::graph::WorkflowGraph;

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn graph_path(&self, graph_id: &str) -> PathBuf {
        self.root.join("graphs").join(format!("{}.json", graph_id))
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    async fn write_atomic<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let write_error = |e: std::io::Error| StoreError::WriteError {
            path: path.display().to_string(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let temp = path.with_extension("json.tmp");
        fs::write(&temp, content.as_bytes())
            .await
            .map_err(write_error)?;
        fs::rename(&temp, path).await.map_err(write_error)?;

        debug!("Wrote {} ({} bytes)", path.display(), content.len());
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path, kind: &str, id: &str) -> Result<T> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind: kind.to_string(),
                    id: id.to_string(),
                })
            }
            Err(e) => {
                return Err(StoreError::ReadError {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save_graph(&self, graph: &WorkflowGraph) -> Result<()> {
        self.write_atomic(&self.graph_path(&graph.id), graph).await
    }

    async fn load_graph(&self, graph_id: &str) -> Result<WorkflowGraph> {
        self.read_json(&self.graph_path(graph_id), "Graph", graph_id)
            .await
    }

    async fn save_run(&self, state: &WorkflowRunState) -> Result<()> {
        self.write_atomic(&self.run_path(&state.run_id), state)
            .await
    }

    async fn load_run(&self, run_id: &str) -> Result<WorkflowRunState> {
        self.read_json(&self.run_path(run_id), "Run", run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        let dir = self.root.join("runs");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::ReadError {
                    path: dir.display().to_string(),
                    message: e.to_string(),
                })
            }
        };

        let mut runs = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::ReadError {
                    path: dir.display().to_string(),
                    message: e.to_string(),
                })?;
            let Some(entry) = entry else { break };

            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    runs.push(stem.to_string());
                }
            }
        }

        runs.sort();
        Ok(runs)
    }
}

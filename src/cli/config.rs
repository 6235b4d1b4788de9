// ABOUTME: Configuration management for the phaseflow CLI
// ABOUTME: Loads YAML config from standard locations and merges PHASEFLOW_* environment overrides

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::engine::{ExecutorBuilder, NodeWorker, WorkflowExecutor, DEFAULT_NODE_TIMEOUT};
use crate::gate::validator::DEFAULT_MAX_ITERATIONS;
use crate::quality::{QualityConfig, QualityConfigError};
use crate::store::JsonFileStore;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid quality settings: {0}")]
    Quality(#[from] QualityConfigError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unbounded when absent
    #[serde(default)]
    pub max_concurrency: Option<NonZeroUsize>,

    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub default_timeout: Duration,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Where `JsonFileStore` keeps graphs and runs
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub quality: QualityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

fn default_timeout() -> Duration {
    DEFAULT_NODE_TIMEOUT
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: None,
            default_timeout: default_timeout(),
            max_iterations: default_max_iterations(),
            state_dir: None,
            quality: QualityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file path or default locations
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => Some(p),
            None => Self::find_config_file(),
        };

        let mut config = match config_path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::Read {
                        path: path.clone(),
                        source,
                    }
                })?;
                serde_yaml::from_str(&contents)
                    .map_err(|source| ConfigError::Parse { path, source })?
            }
            _ => Config::default(),
        };

        config.merge_env(|var| std::env::var(var).ok())?;
        config.quality.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let local = [
            PathBuf::from("phaseflow.yaml"),
            PathBuf::from("phaseflow.yml"),
            PathBuf::from(".phaseflow.yaml"),
            PathBuf::from(".phaseflow.yml"),
        ];

        if let Some(path) = local.into_iter().find(|p| p.exists()) {
            return Some(path);
        }

        dirs::home_dir()
            .map(|home| home.join(".phaseflow").join("config.yaml"))
            .filter(|p| p.exists())
    }

    /// State directory, falling back to `~/.phaseflow/state`
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".phaseflow")
                .join("state")
        })
    }

    /// Executor wired with these settings and a `JsonFileStore` under
    /// [`Config::state_dir`]
    pub fn executor_builder(&self, worker: Arc<dyn NodeWorker>) -> ExecutorBuilder {
        let mut builder = WorkflowExecutor::builder(worker)
            .with_store(Arc::new(JsonFileStore::new(self.state_dir())))
            .with_quality_config(self.quality.clone())
            .with_default_timeout(self.default_timeout)
            .with_max_iterations(self.max_iterations);
        if let Some(max_concurrency) = self.max_concurrency {
            builder = builder.with_max_concurrency(max_concurrency);
        }
        builder
    }

    /// Merge environment overrides. `lookup` is `std::env::var` outside tests.
    pub fn merge_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("PHASEFLOW_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("PHASEFLOW_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Some(dir) = lookup("PHASEFLOW_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup("PHASEFLOW_MAX_CONCURRENCY") {
            self.max_concurrency = Some(parse_env("PHASEFLOW_MAX_CONCURRENCY", &value)?);
        }
        if let Some(value) = lookup("PHASEFLOW_MAX_ITERATIONS") {
            self.max_iterations = parse_env("PHASEFLOW_MAX_ITERATIONS", &value)?;
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

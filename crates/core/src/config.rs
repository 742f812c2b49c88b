use crate::context::IsolationStrategy;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::workflow::plan::PlanConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level orchestrator configuration, usually read from `tessera.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Optional declarative phase plan
    #[serde(default)]
    pub plan: Option<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Overall run deadline; unset means no deadline
    #[serde(default)]
    pub deadline_secs: Option<u64>,

    #[serde(default = "default_max_node_retries")]
    pub max_node_retries: u32,

    #[serde(default = "default_max_recovery_rounds")]
    pub max_recovery_rounds: u32,
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_node_timeout_secs() -> u64 {
    120
}

fn default_max_node_retries() -> u32 {
    2
}

fn default_max_recovery_rounds() -> u32 {
    5
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            node_timeout_secs: default_node_timeout_secs(),
            deadline_secs: None,
            max_node_retries: default_max_node_retries(),
            max_recovery_rounds: default_max_recovery_rounds(),
        }
    }
}

impl ExecutionConfig {
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub strategy: IsolationStrategy,

    /// Worker threads of a dedicated runtime
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Affinity faults tolerated per context before the run is aborted
    #[serde(default = "default_max_affinity_faults")]
    pub max_affinity_faults: u32,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub process: Option<ProcessConfig>,
}

fn default_worker_threads() -> usize {
    2
}

fn default_max_affinity_faults() -> u32 {
    1
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            strategy: IsolationStrategy::default(),
            worker_threads: default_worker_threads(),
            max_affinity_faults: default_max_affinity_faults(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            process: None,
        }
    }
}

/// Worker command used for dedicated-process isolation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_process_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_process_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/results.redb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "tessera=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> OrchestratorResult<Self> {
        if !path.exists() {
            tracing::info!("Configuration file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        Self::read(path).map_err(|e| OrchestratorError::Config(format!("{:#}", e)))
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).context("Failed to read configuration file")?;
        let config: Self =
            toml::from_str(&content).context("Failed to parse configuration file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.execution.concurrency_limit == 0 {
            anyhow::bail!("execution.concurrency_limit must be at least 1");
        }
        if self.execution.node_timeout_secs == 0 {
            anyhow::bail!("execution.node_timeout_secs must be at least 1");
        }
        if self.isolation.worker_threads == 0 {
            anyhow::bail!("isolation.worker_threads must be at least 1");
        }
        if self.isolation.strategy == IsolationStrategy::DedicatedProcess
            && self.isolation.process.is_none()
        {
            anyhow::bail!("isolation.process is required for the dedicated_process strategy");
        }
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gates::Gate;
use crate::pipeline::PipelineRegistry;
use crate::types::TaskType;

/// Top-level configuration loaded from `~/.taskloom/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub vcs: VcsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Step table overrides keyed by task type name.
    #[serde(default)]
    pub pipelines: BTreeMap<String, Vec<String>>,
}

impl Config {
    /// Load config from `~/.taskloom/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.gates.validate()?;
        self.adapter.validate()?;
        for (name, steps) in &self.pipelines {
            if TaskType::from_known(name).is_none() {
                return Err(ConfigError::Validation(format!(
                    "pipelines.{name} does not name a known task type"
                )));
            }
            if steps.is_empty() || steps.iter().any(|s| s.trim().is_empty()) {
                return Err(ConfigError::Validation(format!(
                    "pipelines.{name} must list at least one non-empty step"
                )));
            }
        }
        Ok(())
    }

    /// Registry with the configured step table overrides applied.
    pub fn pipeline_registry(&self) -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        for (name, steps) in &self.pipelines {
            if let Some(task_type) = TaskType::from_known(name) {
                registry.set_override(task_type, steps.clone());
            }
        }
        registry
    }

    pub fn default_path() -> PathBuf {
        taskloom_home().join("config.toml")
    }
}

/// `~/.taskloom`, or `./.taskloom` when no home directory is known.
pub fn taskloom_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskloom")
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Absent means the review loop is unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_review_attempts: Option<u32>,
    #[serde(default = "default_true")]
    pub analyze_dependencies: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            max_review_attempts: None,
            analyze_dependencies: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.concurrency must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "orchestrator.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_review_attempts == Some(0) {
            return Err(ConfigError::Validation(
                "orchestrator.max_review_attempts must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_concurrency() -> usize {
    2
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default = "default_short_gate_secs")]
    pub before_plan_secs: u64,
    #[serde(default = "default_short_gate_secs")]
    pub before_implement_secs: u64,
    #[serde(default = "default_long_gate_secs")]
    pub after_implement_secs: u64,
    #[serde(default = "default_long_gate_secs")]
    pub before_commit_secs: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            before_plan_secs: default_short_gate_secs(),
            before_implement_secs: default_short_gate_secs(),
            after_implement_secs: default_long_gate_secs(),
            before_commit_secs: default_long_gate_secs(),
        }
    }
}

impl GatesConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for gate in Gate::ALL {
            if self.secs_for(gate) == 0 {
                return Err(ConfigError::Validation(format!(
                    "gates.{}_secs must be greater than 0",
                    gate.as_str()
                )));
            }
        }
        Ok(())
    }

    fn secs_for(&self, gate: Gate) -> u64 {
        match gate {
            Gate::BeforePlan => self.before_plan_secs,
            Gate::BeforeImplement => self.before_implement_secs,
            Gate::AfterImplement => self.after_implement_secs,
            Gate::BeforeCommit => self.before_commit_secs,
        }
    }

    pub fn timeout_for(&self, gate: Gate) -> Duration {
        Duration::from_secs(self.secs_for(gate))
    }
}

fn default_short_gate_secs() -> u64 {
    1800
}
fn default_long_gate_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    #[serde(default = "default_adapter_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_adapter_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            command: default_adapter_command(),
            args: Vec::new(),
            timeout_secs: default_adapter_timeout_secs(),
        }
    }
}

impl AdapterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "adapter.command must not be empty".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "adapter.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_adapter_command() -> String {
    "taskloom-worker".into()
}
fn default_adapter_timeout_secs() -> u64 {
    1800
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Empty keeps the store purely in memory.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Persistence directory with `~/` expanded, or `None` for in-memory.
    pub fn resolved_path(&self) -> Option<PathBuf> {
        let path = self.path.trim();
        if path.is_empty() {
            None
        } else {
            Some(expand_home(path))
        }
    }
}

fn default_store_path() -> String {
    "~/.taskloom/store".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_repo_path")]
    pub repo_path: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_path: default_repo_path(),
            branch_prefix: default_branch_prefix(),
        }
    }
}

impl VcsConfig {
    pub fn resolved_repo_path(&self) -> PathBuf {
        expand_home(self.repo_path.trim())
    }
}

fn default_repo_path() -> String {
    ".".into()
}
fn default_branch_prefix() -> String {
    "taskloom/run".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

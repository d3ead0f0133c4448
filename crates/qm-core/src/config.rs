use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Top-level configuration loaded from `.quorum/config.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub kanban: KanbanConfig,
}

impl QuorumConfig {
    /// Load from `<data_dir>/config.yaml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = data_dir.as_ref().join("config.yaml");
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: QuorumConfig =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize to a YAML string.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
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
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` for human-readable output, `json` for log shippers.
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

fn default_project_name() -> String {
    "quorum".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> LogFormat {
    LogFormat::Text
}
fn default_data_dir() -> String {
    ".quorum".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8484
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Concurrency slots per agent name. Admission to an agent waits on a
    /// free slot; the count is never exceeded.
    #[serde(default = "default_slots")]
    pub slots: BTreeMap<String, usize>,
    /// Preferred model per agent name, passed through on execute requests.
    #[serde(default)]
    pub models: BTreeMap<String, String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            models: BTreeMap::new(),
        }
    }
}

fn default_slots() -> BTreeMap<String, usize> {
    BTreeMap::from([
        ("claude".to_string(), 2),
        ("gemini".to_string(), 1),
        ("codex".to_string(), 3),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_task_timeout_s")]
    pub task_timeout_s: u64,
    #[serde(default = "default_phase_timeout_s")]
    pub phase_timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_cancel_grace_s")]
    pub cancel_grace_s: u64,
    #[serde(default = "default_analysis_rounds")]
    pub analysis_rounds: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout_s: default_task_timeout_s(),
            phase_timeout_s: default_phase_timeout_s(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            cancel_grace_s: default_cancel_grace_s(),
            analysis_rounds: default_analysis_rounds(),
            consensus_threshold: default_consensus_threshold(),
        }
    }
}

fn default_task_timeout_s() -> u64 {
    600
}
fn default_phase_timeout_s() -> u64 {
    3600
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_cancel_grace_s() -> u64 {
    5
}
fn default_analysis_rounds() -> u32 {
    2
}
fn default_consensus_threshold() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanConfig {
    #[serde(default)]
    pub auto_enabled: bool,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for KanbanConfig {
    fn default() -> Self {
        Self {
            auto_enabled: false,
            poll_interval_s: default_poll_interval_s(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

fn default_poll_interval_s() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// ConfigHandle — read-mostly snapshot
// ---------------------------------------------------------------------------

/// Atomically swappable config snapshot for hot-reloadable fields
/// (agent limits, timeouts). Readers pay one lock-free-ish clone of an `Arc`.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<QuorumConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<QuorumConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new snapshot.
    pub fn store(&self, config: QuorumConfig) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = QuorumConfig::default();
        assert_eq!(cfg.agents.slots.get("claude"), Some(&2));
        assert_eq!(cfg.agents.slots.get("gemini"), Some(&1));
        assert_eq!(cfg.agents.slots.get("codex"), Some(&3));
        assert_eq!(cfg.engine.task_timeout_s, 600);
        assert_eq!(cfg.engine.phase_timeout_s, 3600);
        assert_eq!(cfg.engine.max_retries, 2);
        assert_eq!(cfg.kanban.failure_threshold, 3);
        assert_eq!(cfg.kanban.poll_interval_s, 5);
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = QuorumConfig::default();
        let yaml = cfg.to_yaml().unwrap();
        let back: QuorumConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.server.port, cfg.server.port);
        assert_eq!(back.agents.slots, cfg.agents.slots);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: QuorumConfig = serde_yaml::from_str("server:\n  port: 9999\n").unwrap();
        assert_eq!(cfg.server.port, 9999);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.engine.max_retries, 2);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = QuorumConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.general.project_name, "quorum");
    }

    #[test]
    fn handle_swaps_snapshot() {
        let handle = ConfigHandle::new(QuorumConfig::default());
        assert_eq!(handle.load().server.port, 8484);

        let mut next = QuorumConfig::default();
        next.server.port = 1234;
        handle.store(next);
        assert_eq!(handle.load().server.port, 1234);
    }
}

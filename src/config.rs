use crate::errors::{TransportError, TransportResult};
use crate::framing::DEFAULT_MAX_PENDING_CHARS;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const MODE_ENV_VAR: &str = "PAPERLESS_ENV";
pub const CONFIG_PATH_ENV_VAR: &str = "PAPERLESS_HOST_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerMode {
    Development,
    Packaged,
}

impl WorkerMode {
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(MODE_ENV_VAR).ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(value) if value.eq_ignore_ascii_case("development") => Self::Development,
            _ => Self::Packaged,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Packaged => "packaged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    /// Pinned mode; `None` reads `PAPERLESS_ENV` when the transport starts.
    pub mode: Option<WorkerMode>,
    pub executable_name: String,
    pub interpreter: String,
    pub entry_point: PathBuf,
    pub project_root: Option<PathBuf>,
    pub resources_dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: None,
            executable_name: "python_backend".to_string(),
            interpreter: "python3".to_string(),
            entry_point: PathBuf::from("runtime/core/main.py"),
            project_root: None,
            resources_dir: None,
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FramingConfig {
    pub max_pending_chars: usize,
    pub read_chunk_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            max_pending_chars: DEFAULT_MAX_PENDING_CHARS,
            read_chunk_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    /// Restarts after an unrequested non-zero exit. A worker that stayed up
    /// for `stable_after_ms` before failing starts a fresh attempt budget.
    #[serde(rename_all = "camelCase")]
    OnFailure {
        max_attempts: u32,
        backoff_ms: u64,
        #[serde(default = "default_stable_after_ms")]
        stable_after_ms: u64,
    },
}

fn default_stable_after_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub boundary_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            boundary_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub worker: WorkerConfig,
    pub framing: FramingConfig,
    /// Sent as `data` when a command is issued without a payload.
    pub default_data: Value,
    pub restart: RestartPolicy,
    pub bridge: BridgeConfig,
    pub log_dir: Option<PathBuf>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            framing: FramingConfig::default(),
            default_data: Value::Object(Default::default()),
            restart: RestartPolicy::Never,
            bridge: BridgeConfig::default(),
            log_dir: None,
        }
    }
}

impl TransportConfig {
    /// Reads a YAML (or JSON) config file. Missing keys fall back to defaults.
    pub fn load(path: &Path) -> TransportResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            TransportError::Config(format!("cannot read {}: {}", path.display(), error))
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `PAPERLESS_HOST_CONFIG`, or defaults when unset.
    pub fn from_env() -> TransportResult<Self> {
        match std::env::var_os(CONFIG_PATH_ENV_VAR) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.framing.max_pending_chars == 0 {
            return Err(TransportError::Config(
                "framing.maxPendingChars must be greater than zero".to_string(),
            ));
        }
        if self.framing.read_chunk_bytes == 0 {
            return Err(TransportError::Config(
                "framing.readChunkBytes must be greater than zero".to_string(),
            ));
        }
        if self.bridge.boundary_capacity == 0 {
            return Err(TransportError::Config(
                "bridge.boundaryCapacity must be greater than zero".to_string(),
            ));
        }
        if self.worker.executable_name.trim().is_empty() {
            return Err(TransportError::Config(
                "worker.executableName cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The pinned mode, or `PAPERLESS_ENV` when unpinned. Read once by
    /// [`crate::transport::Transport::new`].
    pub fn worker_mode(&self) -> WorkerMode {
        self.worker.mode.unwrap_or_else(WorkerMode::from_env)
    }
}

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChatflowError, Result};

/// Top-level chatflow configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on auto-advancing steps within one `advance` call.
    #[serde(default = "default_max_steps")]
    pub max_steps_per_advance: usize,
    /// Used when a flow has no fallback message of its own.
    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,
    #[serde(default = "default_conversation_window")]
    pub conversation_window: usize,
    /// How many applied inbound event ids each state remembers.
    #[serde(default = "default_processed_event_window")]
    pub processed_event_window: usize,
    /// Integration timeout when a node does not set one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_advance: default_max_steps(),
            fallback_message: default_fallback_message(),
            conversation_window: default_conversation_window(),
            processed_event_window: default_processed_event_window(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_max_steps() -> usize { 100 }
fn default_fallback_message() -> String {
    "Sorry, something went wrong. Please try again later.".to_string()
}
fn default_conversation_window() -> usize { 20 }
fn default_processed_event_window() -> usize { 64 }
fn default_timeout_secs() -> u64 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String { "~/.chatflow/chatflow.db".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.2 }

/// Retry configuration for completion requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 8000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_user_agent() -> String { format!("chatflow/{}", env!("CARGO_PKG_VERSION")) }
fn default_connect_timeout() -> u64 { 5 }

/// Per-conversation lane settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Queued events per lane before `submit` waits.
    #[serde(default = "default_lane_buffer")]
    pub buffer: usize,
    /// Idle lanes exit after this many seconds.
    #[serde(default = "default_lane_idle")]
    pub idle_secs: u64,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            buffer: default_lane_buffer(),
            idle_secs: default_lane_idle(),
        }
    }
}

fn default_lane_buffer() -> usize { 64 }
fn default_lane_idle() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Hard cap on transcript steps for one preview.
    #[serde(default = "default_sim_steps")]
    pub max_steps: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            max_steps: default_sim_steps(),
        }
    }
}

fn default_sim_steps() -> usize { 200 }

/// Shell commands run on run lifecycle events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_run_start: Vec<String>,
    #[serde(default)]
    pub on_run_complete: Vec<String>,
    #[serde(default)]
    pub on_run_error: Vec<String>,
    #[serde(default)]
    pub on_handoff: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_run_start.is_empty()
            && self.on_run_complete.is_empty()
            && self.on_run_error.is_empty()
            && self.on_handoff.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable the JSONL run log (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: `~/.chatflow/logs`
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary and incidents, 2 = plus suspensions and handoffs, 3 = every node.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ChatflowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ChatflowError::Config(e.to_string()))
    }

    /// Resolve the SQLite database path (expand ~).
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// Resolve the run log directory.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.chatflow/logs"),
        }
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables are kept verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

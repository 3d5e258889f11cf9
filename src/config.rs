//! Bridge configuration
//!
//! Read from an optional TOML file and overridden by command line flags.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::{default_model_path, locate_executable};
use crate::utils::expand_home;
use crate::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub turn: TurnConfig,

    #[serde(default)]
    pub restart: RestartPolicy,
}

/// Listen address for the HTTP/WebSocket server
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

/// How the backing llama-cli process is launched
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Path to llama-cli; discovered when unset
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Path to the GGUF model; falls back to the model storage default
    #[serde(default)]
    pub model: Option<PathBuf>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_split_mode")]
    pub split_mode: String,

    #[serde(default)]
    pub main_gpu: u32,

    /// Pause after spawn so the startup banner can flush
    #[serde(default = "default_warmup_ms")]
    pub warmup_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: None,
            model: None,
            system_prompt: default_system_prompt(),
            max_tokens: default_max_tokens(),
            split_mode: default_split_mode(),
            main_gpu: 0,
            warmup_ms: default_warmup_ms(),
        }
    }
}

impl ProcessConfig {
    /// Resolve paths into a concrete launch configuration.
    ///
    /// Resolution never fails; a path that does not exist is reported by the
    /// supervisor when it validates the launch.
    pub fn resolve(&self) -> LaunchConfig {
        let executable = self
            .executable
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(locate_executable);
        let model = self
            .model
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(default_model_path);

        LaunchConfig {
            executable,
            model,
            system_prompt: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            split_mode: self.split_mode.clone(),
            main_gpu: self.main_gpu,
            warmup: Duration::from_millis(self.warmup_ms),
        }
    }
}

/// Fully resolved start configuration of one backing process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    pub executable: PathBuf,
    pub model: PathBuf,
    pub system_prompt: String,
    pub max_tokens: u32,
    pub split_mode: String,
    pub main_gpu: u32,
    pub warmup: Duration,
}

impl LaunchConfig {
    /// Argument vector passed to the executable
    pub fn args(&self) -> Vec<String> {
        vec![
            "-m".to_string(),
            self.model.to_string_lossy().into_owned(),
            "--system-prompt".to_string(),
            self.system_prompt.clone(),
            "-n".to_string(),
            self.max_tokens.to_string(),
            "--split-mode".to_string(),
            self.split_mode.clone(),
            "--main-gpu".to_string(),
            self.main_gpu.to_string(),
        ]
    }
}

/// Per-turn limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Upper bound on one turn; on expiry the turn is framed as closed
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// After a missed deadline, how long to keep reading for the prompt
    /// before the process is treated as crashed
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Bytes requested per read from the process output
    #[serde(default = "default_read_window")]
    pub read_window: usize,

    /// Fragments buffered between the bridge and a slow session
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Interactive prompt printed by the process when it awaits input
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            read_window: default_read_window(),
            channel_capacity: default_channel_capacity(),
            prompt: default_prompt(),
        }
    }
}

impl TurnConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Bounded restart with exponential backoff for a crashed process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive automatic restarts allowed (0 disables them)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RestartPolicy {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Backoff before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.min_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_split_mode() -> String {
    "none".to_string()
}

fn default_warmup_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_drain_timeout_secs() -> u64 {
    60
}

fn default_read_window() -> usize {
    128
}

fn default_channel_capacity() -> usize {
    32
}

fn default_prompt() -> String {
    "> ".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Read configuration from a specific path
pub fn read_config_from_path(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::ConfigParse(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: BridgeConfig = toml::from_str(&content)
        .map_err(|e| Error::ConfigParse(format!("Failed to parse {}: {}", path.display(), e)))?;

    tracing::debug!("Loaded bridge config from {:?}", path);

    Ok(config)
}

//! Configuration management for Weaver
//!
//! Loads agent, chat client and self-correction parameters from
//! `~/.weaver/config.json`, with the chat credentials overridable from the
//! environment.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod paths;

pub use paths::{config_path, data_dir};

/// Environment variable holding the chat API key
pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
/// Environment variable overriding the chat API base URL
pub const ENV_BASE_URL: &str = "ANTHROPIC_BASE_URL";
/// Environment variable overriding the model identifier
pub const ENV_MODEL: &str = "ANTHROPIC_MODEL";

/// Provider production endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// Model used when none is configured
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
/// Chat request timeout. Fixed, not read from config.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors in configuration handling
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config decode error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Chat completion endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Empty key means the client runs in offline mock mode
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

impl ChatConfig {
    /// Chat config built purely from the process environment
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay environment variables onto this config
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary lookup. Empty values are ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get(ENV_API_KEY) {
            debug!("◆ API key taken from {}", ENV_API_KEY);
            self.api_key = key;
        }
        if let Some(base) = get(ENV_BASE_URL) {
            self.base_url = base;
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model = model;
        }
    }

    /// Whether a credential is present
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        REQUEST_TIMEOUT
    }
}

/// Agent loop limits and sampling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Most recent history messages replayed into a run
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Capacity of the progress event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            history_limit: default_history_limit(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_max_iterations() -> u32 {
    20
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.3
}

fn default_history_limit() -> usize {
    20
}

fn default_event_buffer() -> usize {
    100
}

/// Self-correction switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionConfig {
    #[serde(default = "default_true")]
    pub retry_on_parse_error: bool,
    #[serde(default = "default_true")]
    pub retry_on_validation: bool,
    #[serde(default = "default_true")]
    pub retry_on_tool_error: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            retry_on_parse_error: true,
            retry_on_validation: true,
            retry_on_tool_error: true,
            max_retries: default_max_retries(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    2
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub correction: CorrectionConfig,
}

impl Config {
    /// Load from the default location and overlay the environment
    pub async fn load() -> Result<Self> {
        let path = config_path();
        let mut config = Self::load_from(&path).await?;
        config.chat.apply_env();
        Ok(config)
    }

    /// Load from specific location, without the environment overlay
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("◆ No config at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        debug!("◆ Reading config from {:?}", path);
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save to the default location
    pub async fn save(&self) -> Result<()> {
        let path = config_path();
        self.save_to(&path).await
    }

    /// Save to specific location
    pub async fn save_to(&self, path: &Path) -> Result<()> {
        debug!("◆ Writing config to {:?}", path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

/// Write a default config file unless one already exists
pub async fn init() -> Result<Config> {
    init_at(&config_path()).await
}

/// Same as [`init`] for an explicit path
pub async fn init_at(path: &Path) -> Result<Config> {
    if path.exists() {
        warn!("◆ Config already present at {:?}", path);
    } else {
        Config::default().save_to(path).await?;
        info!("◆ Config written to {:?}", path);
    }

    Config::load_from(path).await
}

//! Configuration file support

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use bokji_pipeline::{CompactionConfig, PipelineConfig, RetryConfig};

/// Configuration for bokji
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat-completion model id
    pub model: String,
    /// OpenAI-compatible endpoint
    pub base_url: Option<String>,
    /// API key (falls back to OPENAI_API_KEY)
    pub api_key: Option<String>,
    /// Deadline for each external call, in seconds
    pub timeout_secs: u64,
    /// Retries for retryable provider errors
    pub max_retries: u32,
    /// Recompute the rolling summary every this many turns
    pub summary_cadence: u64,
    /// Messages handed to the summarizer
    pub summary_window: usize,
    pub answer_temperature: f32,
    /// JSON array of policy documents for retrieval
    pub documents_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let compaction = CompactionConfig::default();
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key: None,
            timeout_secs: 60,
            max_retries: RetryConfig::default().max_retries,
            summary_cadence: compaction.cadence,
            summary_window: compaction.window,
            answer_temperature: 0.2,
            documents_path: None,
        }
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bokji")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("BOKJI_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file. A missing or broken file yields defaults.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read config file");
                Self::default()
            }
        }
    }

    fn parse(content: &str) -> Self {
        match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "failed to parse config file, using defaults");
                Self::default()
            }
        }
    }

    /// Write the example config if no file exists yet
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// API key from the config, then the environment
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            compaction: CompactionConfig {
                cadence: self.summary_cadence,
                window: self.summary_window,
            },
            call_timeout: Duration::from_secs(self.timeout_secs.max(1)),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# bokji configuration file
# Place at ~/.config/bokji/config.toml (Linux) or set BOKJI_CONFIG_PATH

# Chat-completion model
model = "gpt-4o-mini"

# OpenAI-compatible endpoint (optional)
# base_url = "http://localhost:11434/v1"

# API key (optional - OPENAI_API_KEY is used when unset)
# api_key = "sk-..."

# Deadline for each model call, in seconds
timeout_secs = 60

# Retries for rate limits and transport errors
max_retries = 3

# Recompute the rolling summary every N turns from the last M messages
summary_cadence = 15
summary_window = 8

answer_temperature = 0.2

# Policy documents for retrieval: a JSON array of
# {"id", "title", "requirements", "benefits", "region", "url"}
# documents_path = "~/.config/bokji/policies.json"
"#
}

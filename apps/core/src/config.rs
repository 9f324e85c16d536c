//! Config module - uridx configuration (uridx.toml + environment overrides).
//!
//! Precedence, lowest to highest: built-in defaults, the TOML config file,
//! environment variables (`URIDX_DB_PATH`, `OLLAMA_BASE_URL`,
//! `OLLAMA_EMBED_MODEL`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    /// API base URL (e.g., "http://localhost:11434/v1" for Ollama)
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Optional API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name (e.g., "nomic-embed-text")
    #[serde(default = "default_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_api_base() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: None,
            model: default_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Main uridx configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite store
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Embedding configuration
    #[serde(default)]
    pub embedding: EmbeddingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            embedding: EmbeddingSettings::default(),
        }
    }
}

/// Default store location (<data_dir>/uridx/uridx.db).
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("uridx").join("uridx.db"))
        .unwrap_or_else(|| PathBuf::from("./uridx.db"))
}

/// Default config file path (~/.config/uridx/uridx.toml).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("uridx"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("uridx.toml")
}

impl Config {
    /// Load config from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Cannot parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from the default path (falling back to defaults when absent),
    /// then apply environment overrides.
    pub fn load_default() -> Result<Self> {
        let path = default_config_path();
        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(
            std::env::var("URIDX_DB_PATH").ok(),
            std::env::var("OLLAMA_BASE_URL").ok(),
            std::env::var("OLLAMA_EMBED_MODEL").ok(),
        );
        Ok(config)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).with_context(|| "Cannot serialize config to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Cannot write config file: {}", path.display()))?;

        Ok(())
    }

    fn apply_overrides(
        &mut self,
        db_path: Option<String>,
        api_base: Option<String>,
        model: Option<String>,
    ) {
        if let Some(p) = db_path {
            self.db_path = PathBuf::from(p);
        }
        if let Some(b) = api_base {
            self.embedding.api_base = b;
        }
        if let Some(m) = model {
            self.embedding.model = m;
        }
    }
}

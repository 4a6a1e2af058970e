//! Runtime configuration.
//!
//! Values come from an optional TOML file (`spp.toml`) and are then overlaid
//! with environment variables:
//!
//! | variable              | field             |
//! |-----------------------|-------------------|
//! | `SPP_MODEL`           | `model`           |
//! | `SPP_MAX_CONCURRENCY` | `max_concurrency` |
//! | `SPP_CACHE_PATH`      | `cache_path`      |
//! | `SPP_LOG_JSON`        | `log_json`        |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{Result, SppError};
use crate::eval::EvalConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SppConfig {
    /// Default model for generation nodes
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Maximum backend requests in flight
    pub max_concurrency: usize,
    /// Response cache file; no caching when unset
    pub cache_path: Option<PathBuf>,
    /// Default log level when `RUST_LOG` is unset
    pub log_level: String,
    pub log_json: bool,
}

impl Default for SppConfig {
    fn default() -> Self {
        let eval = EvalConfig::default();
        Self {
            model: eval.model,
            temperature: eval.temperature,
            max_tokens: eval.max_tokens,
            max_concurrency: eval.max_concurrency,
            cache_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl SppConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| SppError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| SppError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Overlay values produced by `lookup` (an environment-like source).
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(model) = lookup("SPP_MODEL") {
            self.model = model;
        }
        if let Some(raw) = lookup("SPP_MAX_CONCURRENCY") {
            self.max_concurrency = raw.trim().parse().map_err(|_| {
                SppError::Config(format!("SPP_MAX_CONCURRENCY must be a positive integer, got {raw:?}"))
            })?;
        }
        if let Some(path) = lookup("SPP_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup("SPP_LOG_JSON") {
            self.log_json = matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SppError::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(SppError::Config("model must not be empty".to_string()));
        }
        self.level().map(|_| ())
    }

    pub fn level(&self) -> Result<Level> {
        Level::from_str(&self.log_level)
            .map_err(|_| SppError::Config(format!("unknown log level: {}", self.log_level)))
    }

    pub fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_concurrency: self.max_concurrency,
        }
    }
}

//! Configuration loading, validation, and management for ctxforge.
//!
//! Loads configuration from `ctxforge.toml` (or the file named by
//! `CTXFORGE_CONFIG`) with environment variable overrides. The budget policy
//! is validated eagerly, so a bad policy is rejected before any build runs.

use ctxforge_core::budget::{BudgetPolicy, OverflowStrategy};
use ctxforge_core::compress::TruncationCompressor;
use ctxforge_core::error::PolicyError;
use ctxforge_core::rerank::RerankConfig;
use ctxforge_core::sanitize::LengthGuard;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "CTXFORGE_CONFIG";
/// Config file used when `CTXFORGE_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "ctxforge.toml";

const TOTAL_WINDOW_ENV: &str = "CTXFORGE_TOTAL_WINDOW_TOKENS";
const RESERVED_OUTPUT_ENV: &str = "CTXFORGE_RESERVED_OUTPUT_TOKENS";
const OVERFLOW_STRATEGY_ENV: &str = "CTXFORGE_OVERFLOW_STRATEGY";

/// The root configuration structure.
///
/// Maps directly to `ctxforge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Token budget policy
    #[serde(default)]
    pub budget: BudgetPolicy,

    /// TTL / dedup / diversity settings
    #[serde(default)]
    pub rerank: RerankConfig,

    /// Compression gate settings
    #[serde(default)]
    pub compress: CompressConfig,

    /// Default sanitizer settings
    #[serde(default)]
    pub sanitize: SanitizeConfig,
}

/// Compression gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressConfig {
    /// Run the compression gate when saturation exceeds the threshold.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the registered compressor to use.
    #[serde(default = "default_compressor")]
    pub compressor: String,
}

fn default_true() -> bool {
    true
}
fn default_compressor() -> String {
    TruncationCompressor::NAME.into()
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compressor: default_compressor(),
        }
    }
}

/// Default sanitizer chain configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizeConfig {
    /// Content longer than this many characters is truncated.
    #[serde(default = "default_max_segment_chars")]
    pub max_segment_chars: usize,
}

fn default_max_segment_chars() -> usize {
    LengthGuard::DEFAULT_MAX_CHARS
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        Self {
            max_segment_chars: default_max_segment_chars(),
        }
    }
}

impl ForgeConfig {
    /// Load configuration from the default location, with env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        Self::parse(&content, path)
    }

    /// Parse and validate TOML content. `origin` is only used in errors.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        tracing::debug!(path = %origin.display(), "Loaded ctxforge config");
        Ok(config)
    }

    /// The config file path: `$CTXFORGE_CONFIG` or `./ctxforge.toml`.
    pub fn config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Apply `CTXFORGE_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup(TOTAL_WINDOW_ENV) {
            self.budget.total_window_tokens = parse_tokens(TOTAL_WINDOW_ENV, &value)?;
        }
        if let Some(value) = lookup(RESERVED_OUTPUT_ENV) {
            self.budget.reserved_output_tokens = parse_tokens(RESERVED_OUTPUT_ENV, &value)?;
        }
        if let Some(value) = lookup(OVERFLOW_STRATEGY_ENV) {
            self.budget.overflow_strategy = parse_strategy(&value)?;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.budget.validate()?;
        self.rerank.validate()?;
        if self.compress.enabled && self.compress.compressor.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "compress.compressor must name a compressor when compression is enabled".into(),
            ));
        }
        if self.sanitize.max_segment_chars == 0 {
            return Err(ConfigError::ValidationError(
                "sanitize.max_segment_chars must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config file content.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn parse_tokens(key: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} must be a token count, got `{value}`")))
}

fn parse_strategy(value: &str) -> Result<OverflowStrategy, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase())).map_err(|_| {
        ConfigError::ValidationError(format!(
            "{OVERFLOW_STRATEGY_ENV} must be one of truncate_lowest_priority, compress, error; got `{value}`"
        ))
    })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid budget policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("Config validation error: {0}")]
    ValidationError(String),
}

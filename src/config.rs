//! Configuration parsing and validation.
//!
//! Opinion Themes is configured via a TOML file (default: `config/themes.toml`).
//! The file has three sections:
//!
//! ```toml
//! [db]
//! url = "sqlite://data/portal.sqlite"
//!
//! [clustering]
//! threshold = 0.82          # cosine similarity needed to join a theme
//! title_sample_size = 8     # member texts sent for title generation
//! retitle_on_attach = false # regenerate titles of themes that grew
//! # batch_limit = 500       # cap on opinions per run
//!
//! [embedding]
//! provider = "openai"       # "openai", "ollama", "hashing", or "disabled"
//! model = "text-embedding-3-small"
//! title_model = "gpt-4o-mini"
//! dims = 1536
//! batch_size = 64
//! concurrency = 4
//! max_retries = 5
//! retry_base_ms = 1000
//! timeout_secs = 30
//! # url = "http://localhost:11434"  # ollama only
//! ```
//!
//! # Validation
//!
//! [`load_config`] checks value ranges. [`Config::validate`] checks that
//! everything a live run needs is present; outside test mode a missing
//! `[db].url` or `clustering.threshold` is a fatal configuration error.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

use opinion_themes_core::error::ConfigurationError;

/// Default similarity threshold for test-mode runs without a config file.
pub const TEST_MODE_THRESHOLD: f32 = 0.8;

/// Default vector size of the offline hashing provider.
pub const HASHING_DIMS: usize = 64;

/// Top-level configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Store connection. Required outside test mode.
    #[serde(default)]
    pub db: Option<DbConfig>,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Store connection settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite connection string, e.g. `sqlite://data/portal.sqlite`.
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Clustering policy.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    /// Cosine similarity needed to join an existing theme (τ).
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(default = "default_title_sample_size")]
    pub title_sample_size: usize,
    #[serde(default)]
    pub retitle_on_attach: bool,
    #[serde(default)]
    pub batch_limit: Option<usize>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            threshold: None,
            title_sample_size: default_title_sample_size(),
            retitle_on_attach: false,
            batch_limit: None,
        }
    }
}

fn default_title_sample_size() -> usize {
    8
}

/// Embedding and title provider settings.
#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Chat/completion model used for titles.
    #[serde(default)]
    pub title_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum embedding requests in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per retry, capped at 2^5 × base.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (Ollama, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            title_model: None,
            dims: None,
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Built-in configuration for test-mode runs without a config file:
    /// offline hashing provider, no store.
    pub fn test_mode_defaults() -> Self {
        Self {
            db: None,
            clustering: ClusteringConfig {
                threshold: Some(TEST_MODE_THRESHOLD),
                ..ClusteringConfig::default()
            },
            embedding: EmbeddingConfig {
                provider: "hashing".to_string(),
                model: Some("hashing".to_string()),
                dims: Some(HASHING_DIMS),
                max_retries: 0,
                ..EmbeddingConfig::default()
            },
        }
    }

    /// Check that a run can start.
    ///
    /// Outside test mode the store URL must be set; the threshold must be
    /// set and in range in both modes (CLI overrides bypass [`parse_config`]).
    /// The provider credential is checked when the client is created.
    pub fn validate(&self, test_mode: bool) -> Result<(), ConfigurationError> {
        if !test_mode && self.db.is_none() {
            return Err(ConfigurationError::Missing("[db].url".to_string()));
        }
        check_threshold(self.threshold()?)?;
        if !self.embedding.is_enabled() {
            return Err(ConfigurationError::Missing(
                "embedding.provider (currently \"disabled\")".to_string(),
            ));
        }
        Ok(())
    }

    /// The configured threshold, or a configuration error.
    pub fn threshold(&self) -> Result<f32, ConfigurationError> {
        self.clustering
            .threshold
            .ok_or_else(|| ConfigurationError::Missing("clustering.threshold".to_string()))
    }

    pub fn db_url(&self) -> Result<&str, ConfigurationError> {
        self.db
            .as_ref()
            .map(|db| db.url.as_str())
            .ok_or_else(|| ConfigurationError::Missing("[db].url".to_string()))
    }
}

fn check_threshold(t: f32) -> Result<(), ConfigurationError> {
    if !t.is_finite() || !(-1.0..=1.0).contains(&t) {
        return Err(ConfigurationError::Invalid(format!(
            "clustering.threshold must be in [-1.0, 1.0], got {}",
            t
        )));
    }
    Ok(())
}

/// Read and parse a config file, validating value ranges.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse config text, validating value ranges.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate clustering
    if let Some(t) = config.clustering.threshold {
        check_threshold(t)?;
    }
    if config.clustering.title_sample_size == 0 {
        bail!(ConfigurationError::Invalid(
            "clustering.title_sample_size must be > 0".to_string()
        ));
    }
    if let Some(db) = &config.db {
        if db.url.trim().is_empty() {
            bail!(ConfigurationError::Missing("[db].url".to_string()));
        }
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        bail!(ConfigurationError::Invalid(
            "embedding.batch_size must be > 0".to_string()
        ));
    }
    if config.embedding.concurrency == 0 {
        bail!(ConfigurationError::Invalid(
            "embedding.concurrency must be > 0".to_string()
        ));
    }
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(ConfigurationError::Missing(format!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            )));
        }
        if config.embedding.model.is_none() && config.embedding.provider != "hashing" {
            bail!(ConfigurationError::Missing(format!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            )));
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "hashing" => {}
        other => bail!(ConfigurationError::Invalid(format!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hashing.",
            other
        ))),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[db]
url = "sqlite://data/portal.sqlite"

[clustering]
threshold = 0.82
title_sample_size = 5

[embedding]
provider = "openai"
model = "text-embedding-3-small"
dims = 1536
"#;

    #[test]
    fn test_parse_full_config() {
        let cfg = parse_config(FULL).unwrap();
        assert_eq!(cfg.db_url().unwrap(), "sqlite://data/portal.sqlite");
        assert_eq!(cfg.threshold().unwrap(), 0.82);
        assert_eq!(cfg.clustering.title_sample_size, 5);
        assert!(!cfg.clustering.retitle_on_attach);
        assert_eq!(cfg.embedding.batch_size, 64);
        assert_eq!(cfg.embedding.concurrency, 4);
        assert!(cfg.validate(false).is_ok());
    }

    #[test]
    fn test_missing_db_is_fatal_outside_test_mode() {
        let cfg = parse_config(
            r#"
[clustering]
threshold = 0.8

[embedding]
provider = "hashing"
dims = 32
"#,
        )
        .unwrap();
        assert_eq!(
            cfg.validate(false).unwrap_err(),
            ConfigurationError::Missing("[db].url".to_string())
        );
        assert!(cfg.validate(true).is_ok());
    }

    #[test]
    fn test_missing_threshold_is_fatal() {
        let cfg = parse_config(
            r#"
[db]
url = "sqlite://x.sqlite"

[embedding]
provider = "hashing"
dims = 32
"#,
        )
        .unwrap();
        assert!(cfg.validate(false).is_err());
        assert!(cfg.validate(true).is_err());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let err = parse_config("[clustering]\nthreshold = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("clustering.threshold"));
    }

    #[test]
    fn test_validate_rechecks_threshold_range() {
        let mut cfg = Config::test_mode_defaults();
        cfg.clustering.threshold = Some(1.5);
        assert!(matches!(
            cfg.validate(true),
            Err(ConfigurationError::Invalid(_))
        ));
        cfg.clustering.threshold = Some(f32::NAN);
        assert!(cfg.validate(true).is_err());
        cfg.clustering.threshold = Some(-1.0);
        assert!(cfg.validate(true).is_ok());
    }

    #[test]
    fn test_unknown_provider() {
        let err = parse_config("[embedding]\nprovider = \"magic\"\nmodel = \"m\"\ndims = 3\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_enabled_provider_needs_dims() {
        assert!(parse_config("[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n").is_err());
    }

    #[test]
    fn test_test_mode_defaults_validate() {
        let cfg = Config::test_mode_defaults();
        assert!(cfg.validate(true).is_ok());
        assert!(cfg.validate(false).is_err());
        assert_eq!(cfg.embedding.dims, Some(HASHING_DIMS));
    }
}

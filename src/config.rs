//! SafeClaw Guard configuration management

use crate::correlation::TagScope;
use crate::error::{Error, Result};
use crate::extract::DEFAULT_MAX_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main SafeClaw Guard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Interception policy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Remote scoring service configuration
    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl GuardConfig {
    /// Parse a configuration document in TOML format.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GuardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.proxy.validate()?;
        self.scoring.validate()
    }
}

/// Interception policy configuration.
///
/// Immutable once a proxy has been built from it; every invocation handled by
/// that proxy reads the same values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Score at or above which a segment counts as an injection
    pub threshold: f64,

    /// Score at or above which a segment is labelled suspect
    pub suspect_threshold: f64,

    /// Refuse calls that cross the threshold (false = report only)
    pub block_injections: bool,

    /// Treat an unreachable scoring service as clean (false = as maximal risk)
    pub fail_open: bool,

    /// Per-attempt scoring timeout in milliseconds
    pub timeout_ms: u64,

    /// Lifetime of correlation tags
    pub tag_scope: TagScope,

    /// Maximum nesting depth of call parameters
    pub max_depth: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            threshold: 0.65,
            suspect_threshold: 0.5,
            block_injections: true,
            fail_open: true,
            timeout_ms: 10_000,
            tag_scope: TagScope::PerSession,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl ProxyConfig {
    /// Per-attempt scoring timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(Error::Config(format!(
                "threshold must be within [0, 1], got {}",
                self.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.suspect_threshold) {
            return Err(Error::Config(format!(
                "suspect_threshold must be within [0, 1], got {}",
                self.suspect_threshold
            )));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive".to_string()));
        }
        if self.max_depth == 0 {
            return Err(Error::Config("max_depth must be positive".to_string()));
        }
        Ok(())
    }
}

/// Remote scoring service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Service base URL (without trailing path)
    pub base_url: String,

    /// Analysis identifier placed in the request path
    pub analysis_id: String,

    /// Environment variable holding the bearer token
    pub api_token_ref: String,

    /// Detections requested from the service
    pub detections: Vec<String>,

    /// Delay before the single retry, in milliseconds
    pub retry_backoff_ms: u64,

    /// Score with the highest result among all configured detections
    /// instead of `prompt_injection` alone
    pub combine_detections: bool,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sonnylabs-service.onrender.com".to_string(),
            analysis_id: String::new(),
            api_token_ref: "SONNYLABS_API_TOKEN".to_string(),
            detections: vec!["prompt_injection".to_string()],
            retry_backoff_ms: 200,
            combine_detections: false,
        }
    }
}

impl ScoringConfig {
    /// Delay before the single retry
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Check required fields.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("scoring.base_url must not be empty".to_string()));
        }
        if self.detections.is_empty() {
            return Err(Error::Config(
                "scoring.detections must name at least one detection".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the bearer token from the referenced environment variable.
    ///
    /// Tries the exact name first, then its UPPER_CASE form.
    pub fn resolve_api_token(&self) -> Result<String> {
        std::env::var(&self.api_token_ref)
            .or_else(|_| std::env::var(self.api_token_ref.to_uppercase()))
            .map_err(|_| {
                Error::Config(format!(
                    "Failed to resolve scoring API token from env var: {}",
                    self.api_token_ref
                ))
            })
    }
}

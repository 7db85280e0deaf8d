//! Validated configuration for the repository core: cache sizing,
//! concurrency limits, sync timeout, and the retry policy applied to
//! transient collaborator errors.
//!
//! Scoped down from the broader `AppConfig` surface elsewhere in this
//! workspace to exactly what `agent-agency-repository` needs.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Errors raised while loading or validating a `RepositoryConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment variable {var}: {message}")]
    InvalidEnvVar { var: &'static str, message: String },

    #[error("configuration failed validation: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Repository tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RepositoryConfig {
    /// Maximum number of evictable entries in the state cache.
    #[validate(range(min = 1, message = "cache_limit must be at least 1"))]
    pub cache_limit: usize,

    /// Global cap on concurrently-executing per-stream task chains.
    #[validate(range(min = 1, message = "concurrency_limit must be at least 1"))]
    pub concurrency_limit: usize,

    /// Default timeout applied to `StateManager::sync` when the caller does
    /// not supply one explicitly.
    #[validate(range(min = 1, message = "default_sync_timeout_ms must be at least 1"))]
    pub default_sync_timeout_ms: u64,

    /// Retry policy for transient collaborator errors (dispatcher timeouts,
    /// individual commit fetch failures). Validated independently by
    /// `agent-agency-resilience`'s own construction path.
    pub retry: agent_agency_resilience::retry::RetryConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            cache_limit: 1000,
            concurrency_limit: 64,
            default_sync_timeout_ms: 5_000,
            retry: agent_agency_resilience::retry::RetryConfig::default(),
        }
    }
}

impl RepositoryConfig {
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(ConfigError::from)
    }

    pub fn default_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.default_sync_timeout_ms)
    }

    /// Overlays `AGENT_AGENCY_REPO_*` environment variables onto defaults,
    /// then validates. Unset variables keep the default; a present-but-
    /// unparsable variable is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(raw) = env::var("AGENT_AGENCY_REPO_CACHE_LIMIT") {
            config.cache_limit = parse_env("AGENT_AGENCY_REPO_CACHE_LIMIT", &raw)?;
        }
        if let Ok(raw) = env::var("AGENT_AGENCY_REPO_CONCURRENCY_LIMIT") {
            config.concurrency_limit = parse_env("AGENT_AGENCY_REPO_CONCURRENCY_LIMIT", &raw)?;
        }
        if let Ok(raw) = env::var("AGENT_AGENCY_REPO_SYNC_TIMEOUT_MS") {
            config.default_sync_timeout_ms = parse_env("AGENT_AGENCY_REPO_SYNC_TIMEOUT_MS", &raw)?;
        }

        config.validate_config()?;
        tracing::info!(
            cache_limit = config.cache_limit,
            concurrency_limit = config.concurrency_limit,
            default_sync_timeout_ms = config.default_sync_timeout_ms,
            "loaded repository configuration"
        );
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
        var,
        message: format!("could not parse {raw:?}"),
    })
}

//! Structured logging init, in the teacher's `observability::logging` style,
//! scoped to a single entry point the owning process calls once before
//! constructing a `Repository`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Installs a global `tracing` subscriber. Idempotent only in the sense that
/// `tracing_subscriber`'s `init()` panics on a second call within the same
/// process — callers own calling this exactly once.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_env("AGENT_AGENCY_REPO_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => {
            subscriber
                .with(fmt::layer().json().with_current_span(false))
                .init();
        }
        LogFormat::Pretty => {
            subscriber.with(fmt::layer().pretty()).init();
        }
        LogFormat::Compact => {
            subscriber.with(fmt::layer().compact()).init();
        }
    }

    tracing::info!(level = %config.level, format = ?config.format, "tracing initialized");
}

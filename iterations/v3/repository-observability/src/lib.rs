//! Ambient logging and metrics for the repository core.

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, LogFormat, LoggingConfig};
pub use metrics::MetricsCollector;

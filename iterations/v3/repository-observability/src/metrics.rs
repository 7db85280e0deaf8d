//! Async counter/gauge collector, scoped down from the teacher's general
//! `MetricsCollector` to the handful of names the repository core emits:
//! `CACHE_HIT_MEMORY`, `CACHE_HIT_LOCAL`, `CACHE_MISS`, `CACHE_EVICTION`,
//! `QUEUE_TASK_DURATION_MS`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricValue {
    pub value: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, MetricValue>,
    pub histograms: HashMap<String, Vec<f64>>,
}

#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: Arc<RwLock<HashMap<String, u64>>>,
    histograms: Arc<RwLock<HashMap<String, Vec<f64>>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn increment_counter(&self, name: &str) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += 1;
    }

    pub async fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        let values = histograms.entry(name.to_string()).or_insert_with(Vec::new);
        values.push(value);
        if values.len() > 1000 {
            values.remove(0);
        }
    }

    pub async fn counter_value(&self, name: &str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let counters = self.counters.read().await;
        let histograms = self.histograms.read().await;
        let now = chrono::Utc::now();
        MetricsSnapshot {
            counters: counters
                .iter()
                .map(|(k, &v)| {
                    (
                        k.clone(),
                        MetricValue {
                            value: v as f64,
                            timestamp: now,
                        },
                    )
                })
                .collect(),
            histograms: histograms.clone(),
        }
    }
}

/// Canonical metric names, so call sites never hand-type a string that
/// drifts from what a dashboard expects.
pub mod names {
    pub const CACHE_HIT_MEMORY: &str = "CACHE_HIT_MEMORY";
    pub const CACHE_HIT_LOCAL: &str = "CACHE_HIT_LOCAL";
    pub const CACHE_MISS: &str = "CACHE_MISS";
    pub const CACHE_EVICTION: &str = "CACHE_EVICTION";
    pub const QUEUE_TASK_DURATION_MS: &str = "QUEUE_TASK_DURATION_MS";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_increments() {
        let collector = MetricsCollector::new();
        collector.increment_counter(names::CACHE_HIT_LOCAL).await;
        collector.increment_counter(names::CACHE_HIT_LOCAL).await;
        assert_eq!(collector.counter_value(names::CACHE_HIT_LOCAL).await, 2);
    }

    #[tokio::test]
    async fn histogram_records_values() {
        let collector = MetricsCollector::new();
        collector.record_histogram(names::QUEUE_TASK_DURATION_MS, 12.0).await;
        let snapshot = collector.snapshot().await;
        assert_eq!(snapshot.histograms[names::QUEUE_TASK_DURATION_MS].len(), 1);
    }
}

//! Built-in in-memory metrics source (§11), plus the short-form query
//! expansion the orchestrator's own APM source understands (§3,
//! `canonicalize`).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use autoscaler_core::{PluginInfo, PluginKind, PluginResult, TimeRange, TimestampedMetric, TimestampedMetrics};
use tokio::sync::RwLock;

pub fn build(driver: &str) -> Option<Arc<dyn autoscaler_core::MetricsSource>> {
    match driver {
        "test-metrics" => Some(Arc::new(TestMetricsSource::new())),
        _ => None,
    }
}

/// Returns whatever single value was last set for a query, as one sample
/// timestamped at `range.to`. Defaults to `0.0` for queries never set.
pub struct TestMetricsSource {
    values: RwLock<HashMap<String, f64>>,
}

impl TestMetricsSource {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_value(&self, query: impl Into<String>, value: f64) {
        self.values.write().await.insert(query.into(), value);
    }
}

impl Default for TestMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl autoscaler_core::MetricsSource for TestMetricsSource {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "test-metrics".into(),
            kind: PluginKind::MetricsSource,
        }
    }

    async fn query(&self, query: &str, range: TimeRange) -> PluginResult<TimestampedMetrics> {
        let value = self.values.read().await.get(query).copied().unwrap_or(0.0);
        Ok(vec![TimestampedMetric {
            timestamp: range.to,
            value,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn query_returns_the_last_set_value() {
        let source = TestMetricsSource::new();
        source.set_value("cpu/web/api", 42.0).await;
        let range = TimeRange {
            from: Utc::now(),
            to: Utc::now(),
        };
        let result = source.query("cpu/web/api", range).await.unwrap();
        assert_eq!(result[0].value, 42.0);
    }

    #[tokio::test]
    async fn query_defaults_to_zero_for_unset_series() {
        let source = TestMetricsSource::new();
        let range = TimeRange {
            from: Utc::now(),
            to: Utc::now(),
        };
        let result = source.query("unset", range).await.unwrap();
        assert_eq!(result[0].value, 0.0);
    }
}

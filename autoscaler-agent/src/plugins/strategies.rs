//! Built-in strategies (§11): `target-value`, `threshold`, `pass-through`
//! and `fixed-value`. Each is dispensed the same way an external strategy
//! plugin would be.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use autoscaler_core::{PluginError, PluginInfo, PluginKind, PluginResult, ScalingAction, Strategy, TimestampedMetrics};

pub fn build(driver: &str) -> Option<Arc<dyn Strategy>> {
    match driver {
        "target-value" => Some(Arc::new(TargetValueStrategy::new())),
        "threshold" => Some(Arc::new(ThresholdStrategy::new())),
        "pass-through" => Some(Arc::new(PassThroughStrategy::new())),
        "fixed-value" => Some(Arc::new(FixedValueStrategy::new())),
        _ => None,
    }
}

fn latest(metrics: &TimestampedMetrics) -> Option<f64> {
    metrics.last().map(|m| m.value)
}

fn parse_f64(config: &HashMap<String, String>, key: &str, plugin: &str) -> PluginResult<f64> {
    config
        .get(key)
        .ok_or_else(|| PluginError::InvalidConfig(format!("{plugin}: missing '{key}'")))?
        .parse::<f64>()
        .map_err(|e| PluginError::InvalidConfig(format!("{plugin}: '{key}' is not a number: {e}")))
}

/// Scales proportionally to how far the latest metric sits from `target`:
/// `factor = metric / target`, `new_count = ceil(base * factor)` where
/// `base` is `current_count`, or `1` when starting from zero (otherwise a
/// factor could never lift a stopped target off the ground).
struct TargetValueStrategy;

impl TargetValueStrategy {
    fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for TargetValueStrategy {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "target-value".into(),
            kind: PluginKind::Strategy,
        }
    }

    async fn run(
        &self,
        metrics: &TimestampedMetrics,
        current_count: i64,
        check_config: &HashMap<String, String>,
    ) -> PluginResult<ScalingAction> {
        let target = parse_f64(check_config, "target", "target-value")?;
        let metric = latest(metrics)
            .ok_or_else(|| PluginError::InvalidConfig("target-value: no metrics returned".into()))?;
        if !metric.is_finite() || !target.is_finite() || target == 0.0 {
            return Err(PluginError::NonFiniteValue {
                plugin: "target-value".into(),
            });
        }

        let factor = metric / target;
        let base = if current_count == 0 { 1.0 } else { current_count as f64 };
        let new_count = (base * factor).ceil() as i64;

        let reason = if new_count == current_count {
            format!("factor of {factor:.6} does not require scaling")
        } else {
            let verb = if new_count > current_count { "up" } else { "down" };
            format!("scaling {verb} because factor is {factor:.6}")
        };

        Ok(if new_count > current_count {
            ScalingAction::up(new_count, reason)
        } else if new_count < current_count {
            ScalingAction::down(new_count, reason)
        } else {
            ScalingAction::none(reason)
        })
    }
}

/// Requires `within_bounds_trigger` of the window's samples to fall inside
/// `[lower_bound, upper_bound)` before acting at all; once that bar is met,
/// adjusts by `delta` toward the bound the latest sample breaches.
struct ThresholdStrategy;

impl ThresholdStrategy {
    fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for ThresholdStrategy {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "threshold".into(),
            kind: PluginKind::Strategy,
        }
    }

    async fn run(
        &self,
        metrics: &TimestampedMetrics,
        current_count: i64,
        check_config: &HashMap<String, String>,
    ) -> PluginResult<ScalingAction> {
        let lower = parse_f64(check_config, "lower_bound", "threshold")?;
        let upper = parse_f64(check_config, "upper_bound", "threshold")?;
        let delta = parse_f64(check_config, "delta", "threshold")? as i64;
        let trigger = parse_f64(check_config, "within_bounds_trigger", "threshold")? as usize;

        let within_count = metrics.iter().filter(|m| m.value >= lower && m.value < upper).count();
        if within_count < trigger {
            return Ok(ScalingAction::none(format!(
                "only {within_count}/{trigger} samples within bounds, not enough to act"
            )));
        }

        let latest_value = latest(metrics)
            .ok_or_else(|| PluginError::InvalidConfig("threshold: no metrics returned".into()))?;
        if latest_value >= upper {
            Ok(ScalingAction::up(
                current_count + delta,
                format!("latest value {latest_value} at or above upper bound {upper}"),
            ))
        } else if latest_value < lower {
            Ok(ScalingAction::down(
                current_count - delta,
                format!("latest value {latest_value} below lower bound {lower}"),
            ))
        } else {
            Ok(ScalingAction::none("within bounds, no action needed"))
        }
    }
}

/// Sets the count directly to the latest metric value; useful for sources
/// that already compute the desired count themselves.
struct PassThroughStrategy;

impl PassThroughStrategy {
    fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for PassThroughStrategy {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "pass-through".into(),
            kind: PluginKind::Strategy,
        }
    }

    async fn run(
        &self,
        metrics: &TimestampedMetrics,
        current_count: i64,
        _check_config: &HashMap<String, String>,
    ) -> PluginResult<ScalingAction> {
        let metric = latest(metrics)
            .ok_or_else(|| PluginError::InvalidConfig("pass-through: no metrics returned".into()))?;
        if !metric.is_finite() {
            return Err(PluginError::NonFiniteValue {
                plugin: "pass-through".into(),
            });
        }
        let new_count = metric.round() as i64;
        let reason = format!("pass-through value is {new_count}");
        Ok(match new_count.cmp(&current_count) {
            std::cmp::Ordering::Greater => ScalingAction::up(new_count, reason),
            std::cmp::Ordering::Less => ScalingAction::down(new_count, reason),
            std::cmp::Ordering::Equal => ScalingAction::none(reason),
        })
    }
}

/// Always targets a fixed count from the check's own config, ignoring
/// metrics entirely. Used in tests and for "pin to N instances" policies.
struct FixedValueStrategy;

impl FixedValueStrategy {
    fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for FixedValueStrategy {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "fixed-value".into(),
            kind: PluginKind::Strategy,
        }
    }

    async fn run(
        &self,
        _metrics: &TimestampedMetrics,
        current_count: i64,
        check_config: &HashMap<String, String>,
    ) -> PluginResult<ScalingAction> {
        let fixed = parse_f64(check_config, "count", "fixed-value")? as i64;
        let reason = format!("fixed-value target is {fixed}");
        Ok(match fixed.cmp(&current_count) {
            std::cmp::Ordering::Greater => ScalingAction::up(fixed, reason),
            std::cmp::Ordering::Less => ScalingAction::down(fixed, reason),
            std::cmp::Ordering::Equal => ScalingAction::none(reason),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_core::TimestampedMetric;
    use chrono::Utc;

    fn metric(value: f64) -> TimestampedMetric {
        TimestampedMetric {
            timestamp: Utc::now(),
            value,
        }
    }

    fn config(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn target_value_scales_up_by_factor() {
        let strategy = TargetValueStrategy::new();
        let action = strategy
            .run(&vec![metric(20.0)], 2, &config(&[("target", "10")]))
            .await
            .unwrap();
        assert_eq!(action.count, 4);
        assert_eq!(action.reason, "scaling up because factor is 2.000000");
    }

    #[tokio::test]
    async fn target_value_scales_up_from_zero() {
        let strategy = TargetValueStrategy::new();
        let action = strategy
            .run(&vec![metric(20.0)], 0, &config(&[("target", "10")]))
            .await
            .unwrap();
        assert_eq!(action.count, 2);
    }

    #[tokio::test]
    async fn threshold_below_trigger_is_none() {
        let strategy = ThresholdStrategy::new();
        let metrics = vec![metric(10.0), metric(10.0), metric(20.0), metric(20.0), metric(20.0)];
        let action = strategy
            .run(
                &metrics,
                1,
                &config(&[
                    ("lower_bound", "5"),
                    ("upper_bound", "20"),
                    ("delta", "1"),
                    ("within_bounds_trigger", "3"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(action.direction, autoscaler_core::Direction::None);
    }
}

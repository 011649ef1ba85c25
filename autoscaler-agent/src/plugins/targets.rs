//! Built-in in-memory target (§11), used by tests and local demos where
//! there is no real orchestrator to scale against.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use autoscaler_core::{PluginError, PluginInfo, PluginKind, PluginResult, ScalingAction, Target, TargetStatus};

pub fn build(driver: &str) -> Option<Arc<dyn Target>> {
    match driver {
        "test-target" => Some(Arc::new(TestTarget::new(0))),
        _ => None,
    }
}

/// An in-memory count with no external side effects. `scale` to the
/// already-current count surfaces as `PluginError::NoOp`, matching a real
/// target's contract.
pub struct TestTarget {
    ready: AtomicBool,
    count: AtomicI64,
}

impl TestTarget {
    pub fn new(initial_count: i64) -> Self {
        Self {
            ready: AtomicBool::new(true),
            count: AtomicI64::new(initial_count),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Target for TestTarget {
    async fn set_config(&self, _config: HashMap<String, String>) -> PluginResult<()> {
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: "test-target".into(),
            kind: PluginKind::Target,
        }
    }

    async fn status(&self, _config: &HashMap<String, String>) -> PluginResult<Option<TargetStatus>> {
        Ok(Some(TargetStatus {
            ready: self.ready.load(Ordering::SeqCst),
            count: self.count.load(Ordering::SeqCst),
            meta: HashMap::new(),
        }))
    }

    async fn scale(&self, action: &ScalingAction, _config: &HashMap<String, String>) -> PluginResult<()> {
        if action.is_dry_run() {
            return Ok(());
        }
        let previous = self.count.swap(action.count, Ordering::SeqCst);
        if previous == action.count {
            return Err(PluginError::NoOp {
                target: "test-target".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scale_to_same_count_is_a_no_op() {
        let target = TestTarget::new(3);
        let err = target
            .scale(&ScalingAction::up(3, "noop"), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NoOp { .. }));
    }

    #[tokio::test]
    async fn scale_updates_reported_count() {
        let target = TestTarget::new(3);
        target
            .scale(&ScalingAction::up(5, "up"), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(target.count(), 5);
    }
}

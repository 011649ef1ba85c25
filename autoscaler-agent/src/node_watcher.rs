//! Node Eligibility Watcher (§4.3): the collaborator the target watcher's
//! optional unknown-allocation augmentation uses to classify allocations
//! stuck in `unknown` client-status by whether their node is still
//! schedulable.
//!
//! Follows the same blocking-index discipline as the target watcher: one
//! long-lived poll loop, reader-writer-locked cache, 10s retry on error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoscaler_core::AutoscalerError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Supplies the current node list; "scheduling-eligibility != eligible"
/// nodes are what the watcher tracks.
#[async_trait]
pub trait NodeEligibilitySource: Send + Sync {
    async fn ineligible_node_ids(&self) -> Result<Vec<String>, AutoscalerError>;
}

pub struct NodeEligibilityWatcher {
    source: Arc<dyn NodeEligibilitySource>,
    ineligible: RwLock<HashSet<String>>,
}

impl NodeEligibilityWatcher {
    pub fn spawn(source: Arc<dyn NodeEligibilitySource>, cancel: CancellationToken) -> Arc<Self> {
        let watcher = Arc::new(Self {
            source,
            ineligible: RwLock::new(HashSet::new()),
        });
        tokio::spawn(poll_loop(watcher.clone(), cancel));
        watcher
    }

    pub async fn is_ineligible(&self, node_id: &str) -> bool {
        self.ineligible.read().await.contains(node_id)
    }
}

async fn poll_loop(watcher: Arc<NodeEligibilityWatcher>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match watcher.source.ineligible_node_ids().await {
            Ok(ids) => {
                let mut set = watcher.ineligible.write().await;
                *set = ids.into_iter().collect();
            }
            Err(e) => {
                warn!(error = %e, "node eligibility poll failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                    _ = cancel.cancelled() => return,
                }
                continue;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource(Vec<String>);

    #[async_trait]
    impl NodeEligibilitySource for FixedSource {
        async fn ineligible_node_ids(&self) -> Result<Vec<String>, AutoscalerError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn tracks_the_latest_ineligible_set() {
        let cancel = CancellationToken::new();
        let watcher = NodeEligibilityWatcher::spawn(Arc::new(FixedSource(vec!["node-1".into()])), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher.is_ineligible("node-1").await);
        assert!(!watcher.is_ineligible("node-2").await);
        cancel.cancel();
    }
}

//! Consistent-hash `PoolFilter` (§4.7): rebuilds a hash ring every time the
//! peer pool changes, and keeps the policy ids that map to this agent.

use std::sync::{Arc, RwLock};

use autoscaler_core::ha::{HaPoolDiscovery, PoolFilter};
use autoscaler_core::hashring::HashRing;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ConsistentHashFilter {
    local_agent_id: String,
    vnodes: usize,
    ring: RwLock<HashRing>,
}

impl ConsistentHashFilter {
    pub fn new(local_agent_id: String, vnodes: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: RwLock::new(HashRing::new(&[], vnodes)),
            local_agent_id,
            vnodes,
        })
    }

    /// Drives pool discovery and keeps the ring in sync until `cancel`
    /// fires, at which point it waits for graceful deregistration.
    pub async fn run(self: Arc<Self>, discovery: Arc<dyn HaPoolDiscovery>, cancel: CancellationToken) {
        let (updates_tx, mut updates_rx) = mpsc::channel(8);
        let (errors_tx, mut errors_rx) = mpsc::channel(8);

        {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                discovery.monitor_pool(cancel, updates_tx, errors_tx).await;
            });
        }
        {
            let discovery = discovery.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                discovery.register_agent(cancel).await;
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    discovery.wait_for_exit().await;
                    return;
                }
                Some(members) = updates_rx.recv() => {
                    info!(members = members.len(), "ha pool changed, rebuilding hash ring");
                    let mut ring = self.ring.write().expect("ring lock poisoned");
                    *ring = HashRing::new(&members, self.vnodes);
                }
                Some(err) = errors_rx.recv() => {
                    warn!(error = %err, "ha pool discovery error");
                }
                else => return,
            }
        }
    }
}

impl PoolFilter for ConsistentHashFilter {
    fn filter(&self, policy_ids: &[String]) -> Vec<String> {
        let ring = self.ring.read().expect("ring lock poisoned");
        if ring.is_empty() {
            // no known peers yet; keep everything rather than silently
            // dropping every policy on this agent.
            return policy_ids.to_vec();
        }
        ring.filter_owned(policy_ids, &self.local_agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_with_no_known_peers_keeps_everything() {
        let filter = ConsistentHashFilter::new("b".into(), 113);
        let ids = vec!["p1".to_string(), "p2".to_string()];
        assert_eq!(filter.filter(&ids), ids);
    }
}

//! Built-in `HaPoolDiscovery` for a pool of exactly one: this agent. Used
//! when `high_availability` is configured without an external pool
//! discovery backend; the consistent-hash filter then degenerates to
//! "every policy belongs to me."

use async_trait::async_trait;
use autoscaler_core::ha::HaPoolDiscovery;
use autoscaler_core::AutoscalerError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct SingleAgentDiscovery {
    agent_id: String,
}

impl SingleAgentDiscovery {
    pub fn new(agent_id: String) -> Self {
        Self { agent_id }
    }
}

#[async_trait]
impl HaPoolDiscovery for SingleAgentDiscovery {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn monitor_pool(&self, cancel: CancellationToken, updates: mpsc::Sender<Vec<String>>, _errors: mpsc::Sender<AutoscalerError>) {
        if updates.send(vec![self.agent_id.clone()]).await.is_err() {
            return;
        }
        cancel.cancelled().await;
    }

    async fn register_agent(&self, cancel: CancellationToken) {
        cancel.cancelled().await;
    }

    async fn reload(&self) {}

    async fn wait_for_exit(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_itself_as_the_only_member() {
        let discovery = SingleAgentDiscovery::new("agent-1".to_string());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(1);
        let (err_tx, _err_rx) = mpsc::channel(1);

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            discovery.monitor_pool(cancel_clone, tx, err_tx).await;
        });

        let members = rx.recv().await.unwrap();
        assert_eq!(members, vec!["agent-1".to_string()]);

        cancel.cancel();
        let _ = handle.await;
    }
}

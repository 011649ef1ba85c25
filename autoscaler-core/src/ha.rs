//! HA collaborator contracts (§6): pool discovery and the distributed lock
//! consumed by the two `PoolFilter` implementations in the agent crate.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::AutoscalerError;

/// Filters a set of policy ids down to the share this agent instance
/// should own. The single method both HA implementations (consistent-hash
/// and lease) share.
pub trait PoolFilter: Send + Sync {
    fn filter(&self, policy_ids: &[String]) -> Vec<String>;
}

/// Discovers the pool of peer agent instances sharing a policy set.
#[async_trait]
pub trait HaPoolDiscovery: Send + Sync {
    /// Stable (ideally restart-surviving) identifier for this agent.
    fn agent_id(&self) -> &str;

    /// Emits the current set of peer ids whenever it changes.
    async fn monitor_pool(
        &self,
        cancel: CancellationToken,
        updates: mpsc::Sender<Vec<String>>,
        errors: mpsc::Sender<AutoscalerError>,
    );

    /// Best-effort self-registration; deregisters on cancellation.
    async fn register_agent(&self, cancel: CancellationToken);

    /// Forces `monitor_pool` to re-query immediately.
    async fn reload(&self);

    /// Bounded wait for graceful deregistration to finish.
    async fn wait_for_exit(&self);
}

/// A time-bounded, renewable, transferable exclusive claim.
#[async_trait]
pub trait HaLock: Send + Sync {
    /// Attempts to acquire the lock before `deadline`. Returns whether this
    /// agent now holds it.
    async fn acquire(&self, cancel: CancellationToken) -> Result<bool, AutoscalerError>;

    /// Renews a held lock. Returns whether it is still held.
    async fn renew(&self, cancel: CancellationToken) -> Result<bool, AutoscalerError>;

    /// Best-effort release.
    async fn release(&self, cancel: CancellationToken) -> Result<(), AutoscalerError>;
}

//! Lease `PoolFilter` (§4.7): a single controller loop that desynchronizes
//! peers with jitter, acquires a `HaLock`, and holds it with periodic
//! renewal until cancelled or a renew fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use autoscaler_core::ha::{HaLock, PoolFilter};
use autoscaler_core::AutoscalerError;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const JITTER_MAX: Duration = Duration::from_millis(500);

pub struct LeaseFilter {
    held: AtomicBool,
}

impl LeaseFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            held: AtomicBool::new(false),
        })
    }

    pub async fn run(self: Arc<Self>, lock: Arc<dyn HaLock>, renew_period: Duration, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                self.held.store(false, Ordering::SeqCst);
                return;
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % JITTER_MAX.as_millis() as u64);
            tokio::select! {
                _ = tokio::time::sleep(jitter) => {}
                _ = cancel.cancelled() => return,
            }

            match lock.acquire(cancel.child_token()).await {
                Ok(true) => {
                    info!("acquired ha lease");
                    self.held.store(true, Ordering::SeqCst);
                    self.hold_until_lost(&lock, renew_period, &cancel).await;
                    self.held.store(false, Ordering::SeqCst);
                    let _ = lock.release(cancel.child_token()).await;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "ha lease acquire failed"),
            }
        }
    }

    async fn hold_until_lost(&self, lock: &Arc<dyn HaLock>, renew_period: Duration, cancel: &CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(renew_period) => {}
                _ = cancel.cancelled() => return,
            }
            match lock.renew(cancel.child_token()).await {
                Ok(true) => continue,
                Ok(false) => {
                    warn!("ha lease renew lost the lock");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "ha lease renew failed");
                    return;
                }
            }
        }
    }
}

impl PoolFilter for LeaseFilter {
    fn filter(&self, policy_ids: &[String]) -> Vec<String> {
        if self.held.load(Ordering::SeqCst) {
            policy_ids.to_vec()
        } else {
            Vec::new()
        }
    }
}

/// A single-process `HaLock` used in tests and single-agent deployments:
/// whichever caller asks first holds it until it releases.
pub struct InMemoryLock {
    held: AtomicBool,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HaLock for InMemoryLock {
    async fn acquire(&self, _cancel: CancellationToken) -> Result<bool, AutoscalerError> {
        Ok(!self.held.swap(true, Ordering::SeqCst))
    }

    async fn renew(&self, _cancel: CancellationToken) -> Result<bool, AutoscalerError> {
        Ok(self.held.load(Ordering::SeqCst))
    }

    async fn release(&self, _cancel: CancellationToken) -> Result<(), AutoscalerError> {
        self.held.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn filter_is_empty_until_the_lease_is_held() {
        let filter = LeaseFilter::new();
        assert!(filter.filter(&["p1".to_string()]).is_empty());
        filter.held.store(true, Ordering::SeqCst);
        assert_eq!(filter.filter(&["p1".to_string()]), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn in_memory_lock_grants_to_a_single_caller() {
        let lock = InMemoryLock::new();
        let cancel = CancellationToken::new();
        assert!(lock.acquire(cancel.clone()).await.unwrap());
        assert!(!lock.acquire(cancel.clone()).await.unwrap());
        lock.release(cancel.clone()).await.unwrap();
        assert!(lock.acquire(cancel).await.unwrap());
    }
}

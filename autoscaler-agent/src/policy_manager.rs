//! Policy Manager (§4.4): merges `monitor_ids` streams from every
//! configured policy source, tracks one handler per enabled policy id, and
//! forwards cooldown and reload requests.
//!
//! An identifier snapshot is processed atomically with respect to itself:
//! all removals happen before all creations, and creations before
//! forwarding updates to already-owned handlers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use autoscaler_core::ha::PoolFilter;
use autoscaler_core::{AutoscalerError, IdSnapshot, Policy, PolicyDefaults, PolicySource, ScalingEvaluation};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::CooldownMessage;
use crate::policy_handler;

/// Substrings that classify a policy-source error as unrecoverable (§4.4,
/// §7): on a match the whole manager restarts after a 10s backoff instead
/// of treating it as a transient per-source failure.
const UNRECOVERABLE_SUBSTRINGS: &[&str] = &["connection refused", "unexpected eof", "broken pipe"];

const RESTART_BACKOFF: Duration = Duration::from_secs(10);

struct HandlerTracker {
    source: String,
    cancel: CancellationToken,
    cooldown_tx: mpsc::Sender<Duration>,
}

pub struct PolicyManager {
    sources: Vec<Arc<dyn PolicySource>>,
    ha_filter: Option<Arc<dyn PoolFilter>>,
    defaults: PolicyDefaults,
    eval_tx: mpsc::Sender<ScalingEvaluation>,
    handlers: RwLock<HashMap<String, HandlerTracker>>,
}

impl PolicyManager {
    pub fn new(
        sources: Vec<Arc<dyn PolicySource>>,
        ha_filter: Option<Arc<dyn PoolFilter>>,
        defaults: PolicyDefaults,
        eval_tx: mpsc::Sender<ScalingEvaluation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sources,
            ha_filter,
            defaults,
            eval_tx,
            handlers: RwLock::new(HashMap::new()),
        })
    }

    /// Fans a reload out to every source, forcing an immediate re-query.
    pub async fn reload_sources(&self) {
        for source in &self.sources {
            source.reload().await;
        }
    }

    /// Sends `duration` on the handler's cooldown channel; silently drops
    /// if the handler no longer exists (CooldownOverflow, §7).
    pub async fn enforce_cooldown(&self, policy_id: &str, duration: Duration) {
        let handlers = self.handlers.read().await;
        if let Some(tracker) = handlers.get(policy_id) {
            let _ = tracker.cooldown_tx.try_send(duration);
        }
    }

    /// Drains cooldown notifications from the evaluation executor and
    /// forwards them to the owning handler.
    pub async fn run_cooldown_relay(self: Arc<Self>, mut cooldown_rx: mpsc::Receiver<CooldownMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                msg = cooldown_rx.recv() => {
                    let Some((policy_id, duration)) = msg else { return };
                    self.enforce_cooldown(&policy_id, duration).await;
                }
            }
        }
    }

    /// Runs until `shutdown` is cancelled, restarting its whole generation
    /// of source tasks and handlers whenever a source reports an
    /// unrecoverable error.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let generation = shutdown.child_token();
            let unrecoverable = self.clone().run_generation(generation.clone(), &shutdown).await;
            self.shutdown_handlers().await;

            if shutdown.is_cancelled() {
                return;
            }
            if !unrecoverable {
                return;
            }
            warn!("policy manager restarting after an unrecoverable source error");
            tokio::select! {
                _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Returns `true` if this generation ended because of an unrecoverable
    /// source error (as opposed to `shutdown` firing).
    async fn run_generation(self: Arc<Self>, generation: CancellationToken, shutdown: &CancellationToken) -> bool {
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<IdSnapshot>(32);
        let (err_tx, mut err_rx) = mpsc::channel::<AutoscalerError>(64);

        for source in &self.sources {
            let source = source.clone();
            let snapshot_tx = snapshot_tx.clone();
            let err_tx = err_tx.clone();
            let cancel = generation.clone();
            tokio::spawn(async move {
                source.monitor_ids(cancel, snapshot_tx, err_tx).await;
            });
        }
        drop(snapshot_tx);
        drop(err_tx);

        let mut tracked: HashMap<String, HashSet<String>> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    generation.cancel();
                    return false;
                }
                snapshot = snapshot_rx.recv() => {
                    let Some(snapshot) = snapshot else { return false };
                    self.handle_snapshot(snapshot, &mut tracked, &generation).await;
                }
                err = err_rx.recv() => {
                    let Some(err) = err else { return false };
                    warn!(error = %err, "policy source error");
                    if is_unrecoverable(&err) {
                        generation.cancel();
                        return true;
                    }
                }
            }
        }
    }

    async fn handle_snapshot(&self, snapshot: IdSnapshot, tracked: &mut HashMap<String, HashSet<String>>, generation: &CancellationToken) {
        let filtered: Vec<String> = match &self.ha_filter {
            Some(filter) => filter.filter(&snapshot.ids),
            None => snapshot.ids.clone(),
        };
        let current: HashSet<String> = filtered.into_iter().collect();
        let previous = tracked.get(&snapshot.source).cloned().unwrap_or_default();

        let removed: Vec<String> = previous.difference(&current).cloned().collect();
        let added: Vec<String> = current.difference(&previous).cloned().collect();

        for id in removed {
            self.remove_handler(&id).await;
        }
        for id in added {
            self.create_handler(id, snapshot.source.clone(), generation).await;
        }

        tracked.insert(snapshot.source, current);
    }

    async fn create_handler(&self, id: String, source_name: String, generation: &CancellationToken) {
        let Some(source) = self.sources.iter().find(|s| s.name() == source_name).cloned() else {
            warn!(policy = %id, source = %source_name, "no such policy source");
            return;
        };

        let cancel = generation.child_token();
        let (raw_tx, mut raw_rx) = mpsc::channel::<Policy>(4);
        let (canon_tx, canon_rx) = mpsc::channel::<Policy>(4);
        let (cooldown_tx, cooldown_rx) = mpsc::channel::<Duration>(4);
        let (err_tx, mut err_rx) = mpsc::channel::<AutoscalerError>(4);

        {
            let source = source.clone();
            let cancel = cancel.clone();
            let id = id.clone();
            tokio::spawn(async move {
                source.monitor_policy(cancel, id, raw_tx, err_tx).await;
            });
        }
        {
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(err) = err_rx.recv().await {
                    warn!(policy = %id, error = %err, "policy document error");
                }
            });
        }

        let defaults = self.defaults;
        tokio::spawn(async move {
            while let Some(policy) = raw_rx.recv().await {
                let canon = autoscaler_core::canonicalize(policy, &defaults);
                if canon_tx.send(canon).await.is_err() {
                    return;
                }
            }
        });

        info!(policy = %id, source = %source_name, "policy handler starting");
        tokio::spawn(policy_handler::run(id.clone(), cancel.clone(), canon_rx, cooldown_rx, self.eval_tx.clone()));

        self.handlers.write().await.insert(
            id,
            HandlerTracker {
                source: source_name,
                cancel,
                cooldown_tx,
            },
        );
    }

    async fn remove_handler(&self, id: &str) {
        if let Some(tracker) = self.handlers.write().await.remove(id) {
            tracker.cancel.cancel();
            info!(policy = %id, source = %tracker.source, "policy handler removed");
        }
    }

    async fn shutdown_handlers(&self) {
        let mut handlers = self.handlers.write().await;
        for (_, tracker) in handlers.drain() {
            tracker.cancel.cancel();
        }
    }
}

fn is_unrecoverable(err: &AutoscalerError) -> bool {
    let message = err.to_string().to_lowercase();
    UNRECOVERABLE_SUBSTRINGS.iter().any(|needle| message.contains(needle))
}

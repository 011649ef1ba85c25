//! Target Status Watcher (§4.2): one watcher per `{namespace, target
//! identity}`, polling the target plugin's `status` call and caching the
//! latest result (or error) behind a reader-writer lock.
//!
//! The design document describes the underlying transport as a blocking
//! long-poll with a server-advanced index; our `Target` plugin contract
//! (§6) exposes a plain `status()` call instead, so the watcher simulates
//! the long-poll by re-polling on [`POLL_INTERVAL`] and otherwise keeps the
//! same state machine and GC discipline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use autoscaler_core::{AutoscalerError, Target, TargetStatus};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);
const INITIAL_DONE_TIMEOUT: Duration = Duration::from_secs(30);
const GC_AGE: Duration = Duration::from_secs(4 * 3600);
pub const GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Running,
    Stopped,
}

struct Cached {
    state: WatcherState,
    status: Option<TargetStatus>,
    error: Option<String>,
    stopped_at: Option<Instant>,
}

/// One long-lived poll loop for a single target, shared by every handler
/// that watches the same `{namespace, target_identity}` pair.
pub struct TargetStatusWatcher {
    target: Arc<dyn Target>,
    config: HashMap<String, String>,
    cached: RwLock<Cached>,
    initial_done: watch::Sender<bool>,
}

impl TargetStatusWatcher {
    pub fn spawn(target: Arc<dyn Target>, config: HashMap<String, String>, cancel: CancellationToken) -> Arc<Self> {
        let (initial_done, _) = watch::channel(false);
        let watcher = Arc::new(Self {
            target,
            config,
            cached: RwLock::new(Cached {
                state: WatcherState::Starting,
                status: None,
                error: None,
                stopped_at: None,
            }),
            initial_done,
        });
        tokio::spawn(poll_loop(watcher.clone(), cancel));
        watcher
    }

    /// Blocks until the first status has arrived (or `Stopped`), bounded by
    /// a 30-second timeout.
    pub async fn status(&self) -> Result<Option<TargetStatus>, AutoscalerError> {
        let mut rx = self.initial_done.subscribe();
        if !*rx.borrow() {
            let waited = tokio::time::timeout(INITIAL_DONE_TIMEOUT, rx.changed()).await;
            if waited.is_err() {
                let mut cached = self.cached.write().await;
                cached.state = WatcherState::Stopped;
                cached.error = Some("target watcher did not become ready within 30s".to_string());
                return Err(AutoscalerError::Plugin {
                    name: "target".into(),
                    kind: "target",
                    message: "initialization timed out".into(),
                });
            }
        }

        let cached = self.cached.read().await;
        match cached.state {
            WatcherState::Stopped if cached.status.is_none() => Err(AutoscalerError::Plugin {
                name: "target".into(),
                kind: "target",
                message: cached.error.clone().unwrap_or_else(|| "target watcher stopped".into()),
            }),
            _ => Ok(cached.status.clone()),
        }
    }

    pub async fn state(&self) -> WatcherState {
        self.cached.read().await.state
    }

    async fn stopped_for_at_least(&self, age: Duration) -> bool {
        let cached = self.cached.read().await;
        cached.state == WatcherState::Stopped
            && cached.stopped_at.map(|at| at.elapsed() >= age).unwrap_or(false)
    }
}

async fn poll_loop(watcher: Arc<TargetStatusWatcher>, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        match watcher.target.status(&watcher.config).await {
            Ok(Some(status)) => {
                let mut cached = watcher.cached.write().await;
                cached.status = Some(status);
                cached.error = None;
                cached.state = WatcherState::Running;
                drop(cached);
                let _ = watcher.initial_done.send(true);
            }
            Ok(None) => {
                let mut cached = watcher.cached.write().await;
                cached.state = WatcherState::Stopped;
                cached.error = Some("target no longer exists".to_string());
                cached.stopped_at = Some(Instant::now());
                drop(cached);
                let _ = watcher.initial_done.send(true);
                info!("target watcher stopping: target reports it no longer exists");
                return;
            }
            Err(e) => {
                warn!(error = %e, "target status poll failed, retrying");
                let mut cached = watcher.cached.write().await;
                cached.error = Some(e.to_string());
                drop(cached);
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

/// Registry of watchers keyed by `{namespace, target identity}`, shared so
/// multiple policies watching the same target reuse one poll loop. A
/// background task garbage-collects watchers that have been `Stopped` for
/// more than four hours.
pub struct TargetWatcherRegistry {
    watchers: RwLock<HashMap<String, Arc<TargetStatusWatcher>>>,
}

impl TargetWatcherRegistry {
    pub fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_spawn(
        &self,
        key: String,
        target: Arc<dyn Target>,
        config: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Arc<TargetStatusWatcher> {
        if let Some(existing) = self.watchers.read().await.get(&key) {
            if existing.state().await != WatcherState::Stopped {
                return existing.clone();
            }
        }
        let watcher = TargetStatusWatcher::spawn(target, config, cancel);
        self.watchers.write().await.insert(key, watcher.clone());
        watcher
    }

    pub async fn run_gc(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(GC_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
            let mut stale = Vec::new();
            for (key, watcher) in self.watchers.read().await.iter() {
                if watcher.stopped_for_at_least(GC_AGE).await {
                    stale.push(key.clone());
                }
            }
            if !stale.is_empty() {
                let mut watchers = self.watchers.write().await;
                for key in stale {
                    watchers.remove(&key);
                }
            }
        }
    }
}

impl Default for TargetWatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

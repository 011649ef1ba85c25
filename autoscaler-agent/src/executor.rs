//! Evaluation Executor (§4.6): a fixed-size worker pool that dequeues
//! `ScalingEvaluation`s, runs every check concurrently, reduces the results,
//! and calls the target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use autoscaler_core::{
    reduce, reduce_groups, AutoscalerError, Check, OnError, Policy, PluginError, ScalingAction, ScalingEvaluation,
    TargetStatus, TimeRange,
};
use chrono::Utc;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin_manager::PluginManager;
use crate::target_watcher::TargetWatcherRegistry;

/// A successful scale invocation reports `(policy_id, cooldown)` so the
/// caller can enforce it; delivered by channel rather than a callback into
/// the policy manager, matching the rest of this codebase's cyclic-reference
/// policy.
pub type CooldownMessage = (String, Duration);

pub struct Executor {
    plugin_manager: Arc<PluginManager>,
    target_watchers: Arc<TargetWatcherRegistry>,
    watcher_cancel: CancellationToken,
}

impl Executor {
    pub fn new(plugin_manager: Arc<PluginManager>, target_watchers: Arc<TargetWatcherRegistry>, watcher_cancel: CancellationToken) -> Self {
        Self {
            plugin_manager,
            target_watchers,
            watcher_cancel,
        }
    }

    pub fn spawn_workers(
        self: Arc<Self>,
        worker_count: usize,
        eval_rx: mpsc::Receiver<ScalingEvaluation>,
        cooldown_tx: mpsc::Sender<CooldownMessage>,
        cancel: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let eval_rx = Arc::new(Mutex::new(eval_rx));
        (0..worker_count.max(1))
            .map(|worker_id| {
                let executor = self.clone();
                let eval_rx = eval_rx.clone();
                let cooldown_tx = cooldown_tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    executor.worker_loop(worker_id, eval_rx, cooldown_tx, cancel).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        eval_rx: Arc<Mutex<mpsc::Receiver<ScalingEvaluation>>>,
        cooldown_tx: mpsc::Sender<CooldownMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            let evaluation = {
                let mut rx = eval_rx.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    item = rx.recv() => item,
                }
            };
            let Some(evaluation) = evaluation else {
                info!(worker = worker_id, "evaluation worker exiting");
                return;
            };
            self.evaluate(evaluation, &cooldown_tx).await;
        }
    }

    async fn evaluate(&self, evaluation: ScalingEvaluation, cooldown_tx: &mpsc::Sender<CooldownMessage>) {
        let start = Instant::now();
        self.evaluate_inner(evaluation, cooldown_tx).await;
        histogram!("scale.evaluate_ms").record(start.elapsed().as_secs_f64() * 1000.0);
    }

    async fn evaluate_inner(&self, evaluation: ScalingEvaluation, cooldown_tx: &mpsc::Sender<CooldownMessage>) {
        let policy = evaluation.policy;

        let target = match self.plugin_manager.get_target(&policy.target.name).await {
            Ok(target) => target,
            Err(e) => {
                warn!(policy = %policy.id, error = %e, "could not resolve target plugin");
                return;
            }
        };

        let watcher = self
            .target_watchers
            .get_or_spawn(
                watcher_key(&policy),
                target.clone(),
                policy.target.config.clone(),
                self.watcher_cancel.clone(),
            )
            .await;

        let status = match watcher.status().await {
            Ok(Some(status)) => status,
            Ok(None) => {
                info!(policy = %policy.id, "target no longer exists, letting the handler be collected");
                return;
            }
            Err(e) => {
                warn!(policy = %policy.id, error = %e, "target status unavailable");
                return;
            }
        };

        if !status.ready {
            warn!(policy = %policy.id, "target not ready, retrying next tick");
            return;
        }

        let winner = if let Some(bounds) = bounds_correction(&policy, &status) {
            bounds
        } else {
            match self.run_checks(&policy, &status).await {
                Ok(Some(action)) => action,
                Ok(None) => return,
                Err(e) => {
                    warn!(policy = %policy.id, error = %e, "evaluation aborted");
                    return;
                }
            }
        };

        if winner.direction == autoscaler_core::Direction::None {
            return;
        }

        let mut action = winner;
        if policy.target.config.get("dry-run").map(|v| v == "true").unwrap_or(false) {
            action = action.into_dry_run();
        }

        let invoke_start = Instant::now();
        let scale_result = target.scale(&action, &policy.target.config).await;
        let invoke_elapsed_ms = invoke_start.elapsed().as_secs_f64() * 1000.0;
        histogram!("scale.invoke_ms").record(invoke_elapsed_ms);
        histogram!("plugin.invoke_ms", "plugin" => policy.target.name.clone()).record(invoke_elapsed_ms);

        match scale_result {
            Ok(()) | Err(PluginError::NoOp { .. }) => {
                counter!("scale.invoke.success_count").increment(1);
                let remaining = remaining_cooldown(&policy, &status);
                let _ = cooldown_tx.send((policy.id.clone(), remaining)).await;
            }
            Err(e) => {
                counter!("scale.invoke.error_count").increment(1);
                error!(policy = %policy.id, error = %e, "scale call failed");
            }
        }
    }

    /// Runs every check concurrently, reduces by group then globally.
    /// Returns `Ok(None)` when there is no winning action to act on.
    async fn run_checks(&self, policy: &Policy, status: &TargetStatus) -> Result<Option<ScalingAction>, AutoscalerError> {
        let now = Utc::now();
        let futures = policy.checks.iter().map(|check| self.run_check(policy, check, status, now));
        let outcomes = futures::future::join_all(futures).await;

        let mut results = Vec::new();
        for outcome in outcomes {
            match outcome? {
                Some(action_for_group) => results.push(action_for_group),
                None => {}
            }
        }

        let winners = reduce_groups(results);
        Ok(reduce(winners))
    }

    async fn run_check(
        &self,
        policy: &Policy,
        check: &Check,
        status: &TargetStatus,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<(Option<String>, ScalingAction)>, AutoscalerError> {
        let effective_on_error = match check.on_error {
            OnError::Inherit => policy.on_check_error,
            other => other,
        };

        match self.evaluate_check(check, status.count, now).await {
            Ok(action) => {
                let action = finalize_check_action(action, policy, status.count);
                Ok(Some((check.group.clone(), action)))
            }
            Err(e) => match effective_on_error {
                OnError::Ignore | OnError::Inherit => {
                    warn!(check = %check.name, error = %e, "check failed, ignoring");
                    Ok(None)
                }
                OnError::Fail => Err(AutoscalerError::CheckFailed {
                    check: check.name.clone(),
                    source: e,
                }),
            },
        }
    }

    async fn evaluate_check(
        &self,
        check: &Check,
        current_count: i64,
        now: chrono::DateTime<Utc>,
    ) -> Result<ScalingAction, PluginError> {
        let range = TimeRange::for_check(now, check);
        let source = self
            .plugin_manager
            .get_metrics_source(&check.source)
            .await
            .map_err(|e| PluginError::Upstream {
                plugin: check.source.clone(),
                message: e.to_string(),
            })?;
        let query_start = Instant::now();
        let query_result = source.query(&check.query, range).await;
        histogram!("plugin.invoke_ms", "plugin" => check.source.clone())
            .record(query_start.elapsed().as_secs_f64() * 1000.0);
        let metrics = autoscaler_core::models::sort_metrics(query_result?);

        let strategy = self
            .plugin_manager
            .get_strategy(&check.strategy.name)
            .await
            .map_err(|e| PluginError::Upstream {
                plugin: check.strategy.name.clone(),
                message: e.to_string(),
            })?;
        let strategy_start = Instant::now();
        let result = strategy.run(&metrics, current_count, &check.strategy.config).await;
        histogram!("plugin.invoke_ms", "plugin" => check.strategy.name.clone())
            .record(strategy_start.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

/// The remaining cooldown to enforce after a successful scale: the policy's
/// full cooldown, unless the target reported an out-of-band last-scaling
/// event more recently than that, in which case only what's left of it.
fn remaining_cooldown(policy: &Policy, status: &TargetStatus) -> Duration {
    match status.last_event() {
        Some(last_event) => {
            let elapsed = (Utc::now() - last_event).to_std().unwrap_or(Duration::ZERO);
            policy.cooldown.saturating_sub(elapsed)
        }
        None => policy.cooldown,
    }
}

fn watcher_key(policy: &Policy) -> String {
    format!("{}::{}", policy.target.name, policy.id)
}

/// Step 2: a count outside `[min, max]` always wins, before any check runs.
fn bounds_correction(policy: &Policy, status: &TargetStatus) -> Option<ScalingAction> {
    if status.count < policy.min {
        Some(ScalingAction::up(
            policy.min,
            format!("current count ({}) below limit ({})", status.count, policy.min),
        ))
    } else if status.count > policy.max {
        Some(ScalingAction::down(
            policy.max,
            format!("current count ({}) above limit ({})", status.count, policy.max),
        ))
    } else {
        None
    }
}

/// Step 3 tail: `none` outside bounds becomes a bounds correction, then the
/// action is capped into `[min, max]` and re-canonicalized as a no-op if it
/// matches the current count.
fn finalize_check_action(action: ScalingAction, policy: &Policy, current_count: i64) -> ScalingAction {
    let action = if action.direction == autoscaler_core::Direction::None {
        if current_count < policy.min {
            ScalingAction::up(policy.min, format!("current count ({current_count}) below limit ({})", policy.min))
        } else if current_count > policy.max {
            ScalingAction::down(policy.max, format!("current count ({current_count}) above limit ({})", policy.max))
        } else {
            action
        }
    } else {
        action
    };
    action.cap_count(policy.min, policy.max).canonicalize_noop(current_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_core::{OnError, PluginRef, PolicyType};

    fn policy_with_cooldown(cooldown: Duration) -> Policy {
        Policy {
            id: "web".to_string(),
            enabled: true,
            policy_type: PolicyType::Horizontal,
            min: 0,
            max: 10,
            cooldown,
            evaluation_interval: Duration::from_secs(10),
            on_check_error: OnError::Fail,
            target: PluginRef::new("test-target"),
            checks: Vec::new(),
        }
    }

    #[test]
    fn remaining_cooldown_is_the_full_policy_cooldown_with_no_last_event() {
        let policy = policy_with_cooldown(Duration::from_secs(60));
        let status = TargetStatus::default();
        assert_eq!(remaining_cooldown(&policy, &status), Duration::from_secs(60));
    }

    #[test]
    fn remaining_cooldown_is_reduced_by_an_out_of_band_last_event() {
        let policy = policy_with_cooldown(Duration::from_secs(60));
        let last_event = Utc::now() - chrono::Duration::seconds(20);
        let status = TargetStatus {
            ready: true,
            count: 0,
            meta: std::collections::HashMap::from([(
                autoscaler_core::models::META_LAST_EVENT.to_string(),
                last_event.timestamp().to_string(),
            )]),
        };

        let remaining = remaining_cooldown(&policy, &status);
        assert!(
            remaining <= Duration::from_secs(41) && remaining >= Duration::from_secs(39),
            "expected ~40s remaining cooldown, got {remaining:?}"
        );
    }

    #[test]
    fn remaining_cooldown_never_goes_negative_once_the_last_event_exceeds_it() {
        let policy = policy_with_cooldown(Duration::from_secs(60));
        let last_event = Utc::now() - chrono::Duration::seconds(120);
        let status = TargetStatus {
            ready: true,
            count: 0,
            meta: std::collections::HashMap::from([(
                autoscaler_core::models::META_LAST_EVENT.to_string(),
                last_event.timestamp().to_string(),
            )]),
        };

        assert_eq!(remaining_cooldown(&policy, &status), Duration::ZERO);
    }
}

//! Policy Handler (§4.5): one per-policy state machine. Owns a ticker whose
//! period is the policy's `evaluation_interval`, driven by four channels:
//! cancellation, policy update, cooldown, and the tick itself.
//!
//! The handler has no retry logic of its own — all transient failures are
//! owned by the evaluation executor (§4.6).

use std::time::Duration;

use autoscaler_core::{Policy, ScalingEvaluation, TargetStatus};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the handler waits for the first policy document before giving
/// up and exiting.
const INITIAL_WAIT: Duration = Duration::from_secs(180);

enum Wake {
    Tick,
    Cancelled,
    PolicyUpdate(Policy),
    Cooldown(Duration),
    Exhausted,
}

/// Runs the handler loop for `policy_id` until cancelled or until no policy
/// arrives within [`INITIAL_WAIT`]. Consumes its channels; the caller keeps
/// the sending halves to drive it.
pub async fn run(
    policy_id: String,
    cancel: CancellationToken,
    mut policy_rx: mpsc::Receiver<Policy>,
    mut cooldown_rx: mpsc::Receiver<Duration>,
    eval_tx: mpsc::Sender<ScalingEvaluation>,
) {
    let mut policy: Option<Policy> = None;
    let mut deadline = Instant::now() + INITIAL_WAIT;
    let mut cooling_down = false;

    loop {
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            Some(p) = policy_rx.recv() => Wake::PolicyUpdate(p),
            Some(d) = cooldown_rx.recv() => Wake::Cooldown(d),
            _ = tokio::time::sleep_until(deadline) => {
                if policy.is_none() && !cooling_down {
                    Wake::Exhausted
                } else {
                    Wake::Tick
                }
            }
        };

        match wake {
            Wake::Cancelled => {
                info!(policy = %policy_id, "policy handler cancelled");
                return;
            }
            Wake::Exhausted => {
                warn!(policy = %policy_id, "no policy document arrived within the initial wait, exiting");
                return;
            }
            Wake::PolicyUpdate(new_policy) => {
                let first = policy.is_none();
                let interval_changed = policy
                    .as_ref()
                    .map(|p| p.evaluation_interval != new_policy.evaluation_interval)
                    .unwrap_or(true);
                policy = Some(new_policy);
                if (first || interval_changed) && !cooling_down {
                    deadline = Instant::now() + policy.as_ref().unwrap().evaluation_interval;
                }
            }
            Wake::Cooldown(d) => {
                cooling_down = true;
                let wait = d.max(Duration::ZERO);
                deadline = Instant::now() + wait;
            }
            Wake::Tick => {
                if cooling_down {
                    cooling_down = false;
                    if let Some(p) = &policy {
                        deadline = Instant::now() + p.evaluation_interval;
                    }
                    continue;
                }
                let Some(p) = &policy else { continue };
                deadline = Instant::now() + p.evaluation_interval;
                if !p.enabled {
                    continue;
                }
                let evaluation = ScalingEvaluation::new(p.clone(), TargetStatus::default());
                if eval_tx.send(evaluation).await.is_err() {
                    warn!(policy = %policy_id, "evaluation channel closed, handler exiting");
                    return;
                }
            }
        }
    }
}

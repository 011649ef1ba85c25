//! Exercises the Policy Handler state machine on its own: ticking,
//! reconfiguring its deadline on policy update, and pausing on cooldown.

use std::time::Duration;

use autoscaler_agent::policy_handler;
use autoscaler_core::{OnError, Policy, PluginRef, PolicyType};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn policy(evaluation_interval: Duration) -> Policy {
    Policy {
        id: "web".to_string(),
        enabled: true,
        policy_type: PolicyType::Horizontal,
        min: 0,
        max: 10,
        cooldown: Duration::from_secs(60),
        evaluation_interval,
        on_check_error: OnError::Fail,
        target: PluginRef::new("test-target"),
        checks: Vec::new(),
    }
}

#[tokio::test]
async fn ticks_on_the_policys_evaluation_interval() {
    let cancel = CancellationToken::new();
    let (policy_tx, policy_rx) = mpsc::channel(4);
    let (_cooldown_tx, cooldown_rx) = mpsc::channel(4);
    let (eval_tx, mut eval_rx) = mpsc::channel(4);

    let handle = tokio::spawn(policy_handler::run("web".to_string(), cancel.clone(), policy_rx, cooldown_rx, eval_tx));

    policy_tx.send(policy(Duration::from_millis(20))).await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), eval_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.policy.id, "web");
    let second = tokio::time::timeout(Duration::from_secs(2), eval_rx.recv()).await.unwrap().unwrap();
    assert_eq!(second.policy.id, "web");

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn a_cooldown_notification_pauses_ticking_until_it_elapses() {
    let cancel = CancellationToken::new();
    let (policy_tx, policy_rx) = mpsc::channel(4);
    let (cooldown_tx, cooldown_rx) = mpsc::channel(4);
    let (eval_tx, mut eval_rx) = mpsc::channel(4);

    let handle = tokio::spawn(policy_handler::run("web".to_string(), cancel.clone(), policy_rx, cooldown_rx, eval_tx));

    policy_tx.send(policy(Duration::from_millis(10))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), eval_rx.recv()).await.unwrap().unwrap();

    // Enforce a cooldown far longer than the evaluation interval: no further
    // evaluation should arrive until it elapses.
    cooldown_tx.send(Duration::from_millis(200)).await.unwrap();

    let no_tick_yet = tokio::time::timeout(Duration::from_millis(60), eval_rx.recv()).await;
    assert!(no_tick_yet.is_err(), "handler must not evaluate while cooling down");

    let resumed = tokio::time::timeout(Duration::from_secs(2), eval_rx.recv()).await.unwrap().unwrap();
    assert_eq!(resumed.policy.id, "web");

    cancel.cancel();
    let _ = handle.await;
}

//! End-to-end exercises of the Evaluation Executor and Plugin Manager
//! against the built-in test plugins, with no external orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use autoscaler_agent::config::DesiredPlugin;
use autoscaler_agent::executor::Executor;
use autoscaler_agent::plugin_manager::PluginManager;
use autoscaler_agent::target_watcher::TargetWatcherRegistry;
use autoscaler_core::{Check, OnError, Policy, PluginKind, PluginRef, PolicyType, ScalingEvaluation, TargetStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn desired(name: &str, driver: &str, kind: PluginKind) -> DesiredPlugin {
    DesiredPlugin {
        name: name.to_string(),
        driver: driver.to_string(),
        kind,
        config: HashMap::new(),
    }
}

async fn plugin_manager_with_builtins() -> Arc<PluginManager> {
    // Built-in plugins advertise a fixed `plugin_info().name` equal to their
    // driver string, so the desired name has to match it exactly.
    let manager = Arc::new(PluginManager::new("./no-such-plugin-dir"));
    manager
        .load(vec![
            desired("test-metrics", "test-metrics", PluginKind::MetricsSource),
            desired("fixed-value", "fixed-value", PluginKind::Strategy),
            desired("test-target", "test-target", PluginKind::Target),
        ])
        .await
        .expect("builtin plugins should start without a subprocess");
    manager
}

fn fixed_value_policy(id: &str, min: i64, max: i64, count: i64, cooldown: Duration) -> Policy {
    Policy {
        id: id.to_string(),
        enabled: true,
        policy_type: PolicyType::Horizontal,
        min,
        max,
        cooldown,
        evaluation_interval: Duration::from_millis(10),
        on_check_error: OnError::Fail,
        target: PluginRef::new("test-target"),
        checks: vec![Check {
            name: "fixed".to_string(),
            source: "test-metrics".to_string(),
            query: "unused".to_string(),
            query_window: Duration::from_secs(60),
            query_window_offset: Duration::ZERO,
            on_error: OnError::Fail,
            group: None,
            strategy: PluginRef {
                name: "fixed-value".to_string(),
                config: HashMap::from([("count".to_string(), count.to_string())]),
            },
        }],
    }
}

#[tokio::test]
async fn a_check_scales_the_target_and_reports_cooldown() {
    let plugin_manager = plugin_manager_with_builtins().await;
    let target_watchers = Arc::new(TargetWatcherRegistry::new());
    let cancel = CancellationToken::new();
    let executor = Arc::new(Executor::new(plugin_manager.clone(), target_watchers, cancel.clone()));

    let (eval_tx, eval_rx) = mpsc::channel(4);
    let (cooldown_tx, mut cooldown_rx) = mpsc::channel(4);
    let workers = executor.spawn_workers(1, eval_rx, cooldown_tx, cancel.clone());

    let policy = fixed_value_policy("web", 0, 100, 5, Duration::from_secs(60));
    eval_tx
        .send(ScalingEvaluation::new(policy.clone(), TargetStatus::default()))
        .await
        .unwrap();

    let (policy_id, cooldown) = tokio::time::timeout(Duration::from_secs(2), cooldown_rx.recv())
        .await
        .expect("cooldown notification within timeout")
        .expect("channel open");
    assert_eq!(policy_id, "web");
    assert_eq!(cooldown, Duration::from_secs(60));

    let target = plugin_manager.get_target("test-target").await.unwrap();
    let status = target.status(&HashMap::new()).await.unwrap().unwrap();
    assert_eq!(status.count, 5);

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
}

#[tokio::test]
async fn a_count_below_min_is_corrected_before_any_check_runs() {
    let plugin_manager = plugin_manager_with_builtins().await;
    let target_watchers = Arc::new(TargetWatcherRegistry::new());
    let cancel = CancellationToken::new();
    let executor = Arc::new(Executor::new(plugin_manager.clone(), target_watchers, cancel.clone()));

    let (eval_tx, eval_rx) = mpsc::channel(4);
    let (cooldown_tx, mut cooldown_rx) = mpsc::channel(4);
    let workers = executor.spawn_workers(1, eval_rx, cooldown_tx, cancel.clone());

    // min = 3, target starts at 0: bounds correction must win even though
    // the only check's fixed-value target (5) would also have scaled up,
    // since the executor resolves bounds correction before running checks.
    let policy = fixed_value_policy("web", 3, 100, 5, Duration::from_secs(60));
    eval_tx
        .send(ScalingEvaluation::new(policy.clone(), TargetStatus::default()))
        .await
        .unwrap();

    let _ = tokio::time::timeout(Duration::from_secs(2), cooldown_rx.recv())
        .await
        .expect("cooldown notification within timeout");

    let target = plugin_manager.get_target("test-target").await.unwrap();
    let status = target.status(&HashMap::new()).await.unwrap().unwrap();
    assert_eq!(status.count, 3);

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
}

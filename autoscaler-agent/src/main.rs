//! Binary entry point: parses CLI args, loads configuration, wires up the
//! Plugin Manager, HA Coordinator, Policy Manager and Evaluation Executor,
//! and runs until `SIGINT`/Ctrl-C.
//!
//! ## Command Line Arguments
//!
//! - `--config, -c`: path to the TOML config file (default: `config.toml`)
//! - `--host`: administrative HTTP host override
//! - `--port, -p`: administrative HTTP port override
//! - `--log-level`: tracing filter override
//!
//! ## Environment Variables
//!
//! - `AUTOSCALER_AGENT_ID`: stable agent identity, bypassing the id file
//! - `AUTOSCALER_HTTP_HOST` / `AUTOSCALER_HTTP_PORT`: admin server override
//! - `AUTOSCALER_PLUGIN_DIR`: external plugin executable directory
//! - `AUTOSCALER_LOG_LEVEL`: tracing filter override

use std::sync::Arc;

use autoscaler_agent::config::{Config, HaConfig};
use autoscaler_agent::executor::Executor;
use autoscaler_agent::ha::lease::InMemoryLock;
use autoscaler_agent::ha::{ConsistentHashFilter, LeaseFilter, SingleAgentDiscovery};
use autoscaler_agent::plugin_manager::PluginManager;
use autoscaler_agent::policy_manager::PolicyManager;
use autoscaler_agent::policy_sources::FilePolicySource;
use autoscaler_agent::target_watcher::TargetWatcherRegistry;
use autoscaler_agent::{agent_id, observability};
use autoscaler_core::ha::PoolFilter;
use autoscaler_core::{PolicySource, ScalingEvaluation};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Administrative HTTP host override.
    #[arg(long)]
    host: Option<String>,

    /// Administrative HTTP port override.
    #[arg(short, long)]
    port: Option<u16>,

    /// Tracing filter override (e.g. "info", "autoscaler_agent=debug").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = &args.host {
        config.http.host = host.clone();
    }
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }

    tracing_subscriber::fmt().with_env_filter(config.logging.level.clone()).init();

    let agent_id = agent_id::resolve()?;
    tracing::info!(agent_id = %agent_id, "starting autoscaler agent");

    let shutdown = CancellationToken::new();

    let plugin_manager = Arc::new(PluginManager::new(config.plugins.directory.clone()));
    if let Err(errors) = plugin_manager.load(config.plugins.desired.clone()).await {
        for e in &errors {
            tracing::error!(error = %e, "plugin failed to start");
        }
    }

    let ha_filter: Option<Arc<dyn PoolFilter>> = match &config.high_availability {
        HaConfig::Disabled => None,
        HaConfig::ConsistentHash { vnodes } => {
            let filter = ConsistentHashFilter::new(agent_id.clone(), *vnodes);
            let discovery = Arc::new(SingleAgentDiscovery::new(agent_id.clone()));
            tokio::spawn(filter.clone().run(discovery, shutdown.child_token()));
            Some(filter)
        }
        HaConfig::Lease { renew_period } => {
            let filter = LeaseFilter::new();
            let lock = Arc::new(InMemoryLock::new());
            tokio::spawn(filter.clone().run(lock, *renew_period, shutdown.child_token()));
            Some(filter)
        }
    };

    let policy_source: Arc<dyn PolicySource> = Arc::new(FilePolicySource::new(
        "file",
        config.policy_source.directory.clone(),
        config.policy_source.poll_interval,
    ));

    let (eval_tx, eval_rx) = mpsc::channel::<ScalingEvaluation>(256);
    let (cooldown_tx, cooldown_rx) = mpsc::channel(64);

    let policy_manager = PolicyManager::new(vec![policy_source], ha_filter, config.policy_defaults(), eval_tx);

    let target_watchers = Arc::new(TargetWatcherRegistry::new());
    let executor = Arc::new(Executor::new(plugin_manager.clone(), target_watchers.clone(), shutdown.child_token()));

    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    tasks.push(tokio::spawn(policy_manager.clone().run(shutdown.child_token())));
    tasks.push(tokio::spawn(policy_manager.clone().run_cooldown_relay(cooldown_rx, shutdown.child_token())));
    tasks.extend(executor.spawn_workers(config.executor_workers, eval_rx, cooldown_tx, shutdown.child_token()));

    {
        let target_watchers = target_watchers.clone();
        let cancel = shutdown.child_token();
        tasks.push(tokio::spawn(async move { target_watchers.run_gc(cancel).await }));
    }

    {
        let host = config.http.host.clone();
        let port = config.http.port;
        let cancel = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = observability::serve(&host, port, cancel).await {
                tracing::error!(error = %e, "observability server exited");
            }
        }));
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
    plugin_manager.kill_all().await;

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

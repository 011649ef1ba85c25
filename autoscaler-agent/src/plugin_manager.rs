//! Plugin Manager (§4.1): resolves configured plugins to either a built-in
//! factory or an external subprocess, starts them, and dispenses typed
//! handles to the rest of the engine.
//!
//! A plugin is "internal" when its `driver` matches a known built-in AND no
//! same-named executable is present in the plugin directory; otherwise the
//! manager shells out to that executable and speaks a small line-oriented
//! JSON-RPC protocol over its stdio.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use autoscaler_core::{AutoscalerError, MetricsSource, PluginError, PluginInfo, PluginKind, Result, ScalingAction, Strategy, Target, TargetStatus, TimeRange, TimestampedMetrics};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DesiredPlugin;
use crate::plugins::{metrics as builtin_metrics, strategies as builtin_strategies, targets as builtin_targets};

#[derive(Clone)]
enum Handle {
    MetricsSource(Arc<dyn MetricsSource>),
    Strategy(Arc<dyn Strategy>),
    Target(Arc<dyn Target>),
}

impl Handle {
    fn plugin_info(&self) -> PluginInfo {
        match self {
            Handle::MetricsSource(p) => p.plugin_info(),
            Handle::Strategy(p) => p.plugin_info(),
            Handle::Target(p) => p.plugin_info(),
        }
    }
}

struct Installed {
    desired: DesiredPlugin,
    handle: Handle,
}

/// Owns the lifecycle of every configured plugin and hands out typed handles.
pub struct PluginManager {
    plugin_dir: PathBuf,
    installed: DashMap<String, Installed>,
}

impl PluginManager {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            installed: DashMap::new(),
        }
    }

    /// Starts every desired plugin. Per-plugin failures are collected rather
    /// than aborting the whole batch.
    pub async fn load(&self, desired: Vec<DesiredPlugin>) -> std::result::Result<(), Vec<AutoscalerError>> {
        let mut errors = Vec::new();
        for plugin in desired {
            if let Err(e) = self.start_one(plugin).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Diffs `new_plugins` against the running set: stops removed plugins,
    /// re-applies config to the intersection, and starts newly added ones.
    pub async fn reload(&self, new_plugins: Vec<DesiredPlugin>) -> std::result::Result<(), Vec<AutoscalerError>> {
        let wanted: HashMap<String, DesiredPlugin> =
            new_plugins.into_iter().map(|p| (p.name.clone(), p)).collect();

        let to_remove: Vec<String> = self
            .installed
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !wanted.contains_key(name))
            .collect();
        for name in to_remove {
            self.stop_one(&name).await;
        }

        let mut errors = Vec::new();
        for (name, plugin) in wanted {
            if let Some(mut entry) = self.installed.get_mut(&name) {
                if let Err(e) = set_config(&entry.handle, plugin.config.clone()).await {
                    errors.push(AutoscalerError::Plugin {
                        name: name.clone(),
                        kind: plugin.kind.as_str(),
                        message: e.to_string(),
                    });
                } else {
                    entry.desired = plugin;
                }
            } else if let Err(e) = self.start_one(plugin).await {
                errors.push(e);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Stops every external process the manager owns.
    pub async fn kill_all(&self) {
        let names: Vec<String> = self.installed.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop_one(&name).await;
        }
    }

    pub async fn get_metrics_source(&self, name: &str) -> Result<Arc<dyn MetricsSource>> {
        match self.dispense(name, PluginKind::MetricsSource).await? {
            Handle::MetricsSource(p) => Ok(p),
            _ => unreachable!("dispense returns the kind it was asked for"),
        }
    }

    pub async fn get_strategy(&self, name: &str) -> Result<Arc<dyn Strategy>> {
        match self.dispense(name, PluginKind::Strategy).await? {
            Handle::Strategy(p) => Ok(p),
            _ => unreachable!("dispense returns the kind it was asked for"),
        }
    }

    pub async fn get_target(&self, name: &str) -> Result<Arc<dyn Target>> {
        match self.dispense(name, PluginKind::Target).await? {
            Handle::Target(p) => Ok(p),
            _ => unreachable!("dispense returns the kind it was asked for"),
        }
    }

    /// Returns a typed handle, probing the plugin's advertised identity
    /// first. A failed probe is not fatal: the instance is killed and
    /// re-dispensed once before the failure is surfaced to the caller.
    async fn dispense(&self, name: &str, kind: PluginKind) -> Result<Handle> {
        if self.probe_ok(name, kind).await {
            return Ok(self.installed.get(name).unwrap().handle.clone());
        }

        warn!(plugin = name, kind = kind.as_str(), "plugin identity probe failed, restarting once");
        let desired = self
            .installed
            .get(name)
            .map(|e| e.desired.clone())
            .ok_or_else(|| AutoscalerError::Plugin {
                name: name.to_string(),
                kind: kind.as_str(),
                message: "no such plugin configured".into(),
            })?;
        self.stop_one(name).await;
        self.start_one(desired).await?;

        if self.probe_ok(name, kind).await {
            Ok(self.installed.get(name).unwrap().handle.clone())
        } else {
            Err(AutoscalerError::Plugin {
                name: name.to_string(),
                kind: kind.as_str(),
                message: "plugin restart did not recover a healthy identity".into(),
            })
        }
    }

    async fn probe_ok(&self, name: &str, kind: PluginKind) -> bool {
        let Some(entry) = self.installed.get(name) else {
            return false;
        };
        let info = entry.handle.plugin_info();
        info.name == name && info.kind == kind
    }

    async fn start_one(&self, desired: DesiredPlugin) -> Result<()> {
        let executable = self.plugin_dir.join(&desired.driver);
        let handle = if !executable.exists() {
            self.start_builtin(&desired)?
        } else {
            self.start_external(&desired, executable).await?
        };

        set_config(&handle, desired.config.clone())
            .await
            .map_err(|e| AutoscalerError::Plugin {
                name: desired.name.clone(),
                kind: desired.kind.as_str(),
                message: e.to_string(),
            })?;

        let info = handle.plugin_info();
        if info.name != desired.name || info.kind != desired.kind {
            return Err(AutoscalerError::Plugin {
                name: desired.name.clone(),
                kind: desired.kind.as_str(),
                message: format!(
                    "advertised identity {{{}, {}}} does not match configuration",
                    info.name,
                    info.kind.as_str()
                ),
            });
        }

        info!(plugin = %desired.name, driver = %desired.driver, kind = desired.kind.as_str(), "plugin started");
        self.installed.insert(desired.name.clone(), Installed { desired, handle });
        Ok(())
    }

    fn start_builtin(&self, desired: &DesiredPlugin) -> Result<Handle> {
        let handle = match desired.kind {
            PluginKind::MetricsSource => builtin_metrics::build(&desired.driver).map(Handle::MetricsSource),
            PluginKind::Strategy => builtin_strategies::build(&desired.driver).map(Handle::Strategy),
            PluginKind::Target => builtin_targets::build(&desired.driver).map(Handle::Target),
        };
        handle.ok_or_else(|| AutoscalerError::Plugin {
            name: desired.name.clone(),
            kind: desired.kind.as_str(),
            message: format!("no built-in driver named '{}'", desired.driver),
        })
    }

    async fn start_external(&self, desired: &DesiredPlugin, executable: PathBuf) -> Result<Handle> {
        let process = ExternalPlugin::spawn(desired.name.clone(), executable)
            .await
            .map_err(|e| AutoscalerError::Plugin {
                name: desired.name.clone(),
                kind: desired.kind.as_str(),
                message: e.to_string(),
            })?;
        let process = Arc::new(process);
        Ok(match desired.kind {
            PluginKind::MetricsSource => Handle::MetricsSource(process),
            PluginKind::Strategy => Handle::Strategy(process),
            PluginKind::Target => Handle::Target(process),
        })
    }

    /// Drops the manager's reference to a plugin. External plugins are
    /// spawned with `kill_on_drop`, so once no handle outlives this remove
    /// the subprocess is reaped automatically.
    async fn stop_one(&self, name: &str) {
        if self.installed.remove(name).is_some() {
            debug!(plugin = name, "plugin stopped");
        }
    }
}

async fn set_config(handle: &Handle, config: HashMap<String, String>) -> autoscaler_core::PluginResult<()> {
    match handle {
        Handle::MetricsSource(p) => p.set_config(config).await,
        Handle::Strategy(p) => p.set_config(config).await,
        Handle::Target(p) => p.set_config(config).await,
    }
}

/// A plugin hosted as a subprocess, speaking line-delimited JSON requests
/// and responses over its stdio.
struct ExternalPlugin {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    stdout: Mutex<BufReader<tokio::process::ChildStdout>>,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    result: Value,
}

impl ExternalPlugin {
    async fn spawn(name: String, executable: PathBuf) -> anyhow::Result<Self> {
        let mut child = Command::new(&executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        Ok(Self {
            name,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
        })
    }

    async fn call(&self, method: &str, params: Value) -> autoscaler_core::PluginResult<Value> {
        let request = RpcRequest { method, params };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| PluginError::Process(e.to_string()))?;
        line.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| PluginError::Process(e.to_string()))?;
        }

        let mut response_line = String::new();
        {
            let mut stdout = self.stdout.lock().await;
            stdout
                .read_line(&mut response_line)
                .await
                .map_err(|e| PluginError::Process(e.to_string()))?;
        }
        if response_line.is_empty() {
            return Err(PluginError::Process(format!("{} closed its stdout", self.name)));
        }

        let response: RpcResponse =
            serde_json::from_str(&response_line).map_err(|e| PluginError::Process(e.to_string()))?;
        if response.ok {
            Ok(response.result)
        } else {
            Err(PluginError::Upstream {
                plugin: self.name.clone(),
                message: response.error.unwrap_or_else(|| "unknown plugin error".into()),
            })
        }
    }
}

#[async_trait]
impl MetricsSource for ExternalPlugin {
    async fn set_config(&self, config: HashMap<String, String>) -> autoscaler_core::PluginResult<()> {
        self.call("set_config", serde_json::json!({ "config": config })).await?;
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            kind: PluginKind::MetricsSource,
        }
    }

    async fn query(&self, query: &str, range: TimeRange) -> autoscaler_core::PluginResult<TimestampedMetrics> {
        let result = self
            .call("query", serde_json::json!({ "query": query, "range": range }))
            .await?;
        serde_json::from_value(result).map_err(|e| PluginError::Upstream {
            plugin: self.name.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Strategy for ExternalPlugin {
    async fn set_config(&self, config: HashMap<String, String>) -> autoscaler_core::PluginResult<()> {
        self.call("set_config", serde_json::json!({ "config": config })).await?;
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            kind: PluginKind::Strategy,
        }
    }

    async fn run(
        &self,
        metrics: &TimestampedMetrics,
        current_count: i64,
        check_config: &HashMap<String, String>,
    ) -> autoscaler_core::PluginResult<ScalingAction> {
        let result = self
            .call(
                "run",
                serde_json::json!({ "metrics": metrics, "current_count": current_count, "check_config": check_config }),
            )
            .await?;
        serde_json::from_value(result).map_err(|e| PluginError::Upstream {
            plugin: self.name.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Target for ExternalPlugin {
    async fn set_config(&self, config: HashMap<String, String>) -> autoscaler_core::PluginResult<()> {
        self.call("set_config", serde_json::json!({ "config": config })).await?;
        Ok(())
    }

    fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            kind: PluginKind::Target,
        }
    }

    async fn status(&self, config: &HashMap<String, String>) -> autoscaler_core::PluginResult<Option<TargetStatus>> {
        let result = self.call("status", serde_json::json!({ "config": config })).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| PluginError::Upstream {
                plugin: self.name.clone(),
                message: e.to_string(),
            })
    }

    async fn scale(&self, action: &ScalingAction, config: &HashMap<String, String>) -> autoscaler_core::PluginResult<()> {
        let result = self
            .call("scale", serde_json::json!({ "action": action, "config": config }))
            .await?;
        if result.get("no_op").and_then(Value::as_bool).unwrap_or(false) {
            return Err(PluginError::NoOp {
                target: self.name.clone(),
            });
        }
        Ok(())
    }
}

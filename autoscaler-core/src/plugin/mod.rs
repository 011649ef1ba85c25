//! External interfaces (§6): the three plugin kinds the evaluation executor
//! and the target-status watcher consume, plus the policy-source and HA
//! collaborator contracts.
//!
//! Every plugin kind shares the same small prelude (`set_config`,
//! `plugin_info`) regardless of whether the concrete implementation lives
//! in-process or behind an RPC boundary to a subprocess — the Plugin
//! Manager is the only component that needs to know which.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PluginResult;
use crate::models::{ScalingAction, TargetStatus, TimeRange, TimestampedMetrics};

/// The three kinds of plugin the engine dispenses. Used for identity
/// verification on dispense and for plugin-directory resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    MetricsSource,
    Strategy,
    Target,
}

impl PluginKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PluginKind::MetricsSource => "metrics_source",
            PluginKind::Strategy => "strategy",
            PluginKind::Target => "target",
        }
    }
}

/// What a plugin advertises about itself; checked against the configured
/// `{name, type}` before the Plugin Manager hands out a handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub kind: PluginKind,
}

/// A metrics source: resolves a check's `query` over a `TimeRange` into
/// one or more timestamped series.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn set_config(&self, config: HashMap<String, String>) -> PluginResult<()>;

    fn plugin_info(&self) -> PluginInfo;

    async fn query(&self, query: &str, range: TimeRange) -> PluginResult<TimestampedMetrics>;

    /// Some sources (e.g. ones that expand a query into several related
    /// series) can return more than one series per query; the default
    /// implementation wraps `query` into a single-element result.
    async fn query_multiple(
        &self,
        query: &str,
        range: TimeRange,
    ) -> PluginResult<Vec<TimestampedMetrics>> {
        Ok(vec![self.query(query, range).await?])
    }
}

/// A scaling strategy: decides a `ScalingAction` from the current count and
/// the metrics a check resolved.
#[async_trait]
pub trait Strategy: Send + Sync {
    async fn set_config(&self, config: HashMap<String, String>) -> PluginResult<()>;

    fn plugin_info(&self) -> PluginInfo;

    async fn run(
        &self,
        metrics: &TimestampedMetrics,
        current_count: i64,
        check_config: &HashMap<String, String>,
    ) -> PluginResult<ScalingAction>;
}

/// A scaling target: reports its current status and accepts scale commands.
#[async_trait]
pub trait Target: Send + Sync {
    async fn set_config(&self, config: HashMap<String, String>) -> PluginResult<()>;

    fn plugin_info(&self) -> PluginInfo;

    /// `Ok(None)` means the target no longer exists.
    async fn status(&self, config: &HashMap<String, String>) -> PluginResult<Option<TargetStatus>>;

    /// Scaling a target that was already at the requested count is expected
    /// to surface as `PluginError::NoOp`, which callers treat as success.
    async fn scale(
        &self,
        action: &ScalingAction,
        config: &HashMap<String, String>,
    ) -> PluginResult<()>;
}

//! Error taxonomy shared by every crate in the workspace.
//!
//! Mirrors the two-tier split used throughout this codebase: a crate-level
//! error for engine-facing failures, and a narrower error for the plugin
//! boundary described by the `MetricsSource`/`Strategy`/`Target` traits.

use thiserror::Error;

/// Engine-facing errors: policy manager, policy handler, evaluation
/// executor, plugin manager and HA coordinator all report through this type.
#[derive(Error, Debug)]
pub enum AutoscalerError {
    /// A policy document failed validation at its source.
    #[error("invalid policy {id}: {message}")]
    InvalidPolicy { id: String, message: String },

    /// The plugin manager could not resolve, start, or health-check a plugin.
    #[error("plugin {name} ({kind}): {message}")]
    Plugin {
        name: String,
        kind: &'static str,
        message: String,
    },

    /// A check's metrics source or strategy call failed and the policy's
    /// `on_check_error` (or the check's own `on_error`) says to fail the
    /// whole evaluation rather than ignore the check.
    #[error("check {check} failed: {source}")]
    CheckFailed {
        check: String,
        #[source]
        source: PluginError,
    },

    /// The target reported it is not yet ready to accept a scaling action.
    #[error("target not ready for policy {policy_id}")]
    TargetNotReady { policy_id: String },

    /// The target no longer exists (status returned `None` with no error).
    #[error("target for policy {policy_id} no longer exists")]
    TargetGone { policy_id: String },

    /// A policy source's identifier stream failed in a way classified as
    /// unrecoverable (connection refused, unexpected EOF, ...).
    #[error("unrecoverable source error from {source_name}: {message}")]
    UnrecoverableSource { source_name: String, message: String },

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// An I/O failure (agent-identity file, plugin directory scan, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned across the plugin RPC/in-process boundary (§6 of the
/// design document): `set_config`, `plugin_info`, `query`, `run`, `status`,
/// `scale`.
#[derive(Error, Debug, Clone)]
pub enum PluginError {
    /// The plugin rejected the configuration handed to `set_config`.
    #[error("invalid plugin configuration: {0}")]
    InvalidConfig(String),

    /// The plugin's advertised `{name, type}` did not match what was asked for.
    #[error("plugin identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: String, actual: String },

    /// A query or strategy run produced a non-finite value (NaN/inf).
    #[error("non-finite value produced by {plugin}")]
    NonFiniteValue { plugin: String },

    /// Generic upstream failure (network, process crash, malformed response).
    #[error("{plugin} error: {message}")]
    Upstream { plugin: String, message: String },

    /// The target reported a scale call as a no-op; callers should treat
    /// this identically to success.
    #[error("no-op scale for target {target}")]
    NoOp { target: String },

    /// The external plugin process could not be spawned or crashed.
    #[error("plugin process error: {0}")]
    Process(String),
}

pub type Result<T> = std::result::Result<T, AutoscalerError>;
pub type PluginResult<T> = std::result::Result<T, PluginError>;

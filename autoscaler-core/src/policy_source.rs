//! The `PolicySource` contract (§4.4): discovers which policies are
//! enabled, and supplies their canonicalized documents on demand.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AutoscalerError;
use crate::models::Policy;

/// A full snapshot of enabled policy identifiers from one source, tagged
/// with the source's own name so the manager can route updates back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSnapshot {
    pub source: String,
    pub ids: Vec<String>,
}

/// A policy discovery backend. `monitor_ids` and `monitor_policy` are
/// long-lived: they run until their context is cancelled, pushing onto the
/// provided sinks whenever new data is observed.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Stable tag used to route policy updates back to the source that
    /// owns them.
    fn name(&self) -> &str;

    /// Emits the current full set of enabled policy ids whenever it
    /// changes (and on `reload`, and on the source's own ticker).
    async fn monitor_ids(
        &self,
        cancel: tokio_util::sync::CancellationToken,
        results: mpsc::Sender<IdSnapshot>,
        errors: mpsc::Sender<AutoscalerError>,
    );

    /// Emits the latest validated-and-canonicalized policy for `id` every
    /// time its modify-index advances.
    async fn monitor_policy(
        &self,
        cancel: tokio_util::sync::CancellationToken,
        id: String,
        results: mpsc::Sender<Policy>,
        errors: mpsc::Sender<AutoscalerError>,
    );

    /// Forces `monitor_ids` to re-query immediately rather than waiting for
    /// its own ticker or a server-pushed change.
    async fn reload(&self);
}

//! `PolicySource` backed by a directory of `*.json` policy documents on the
//! local filesystem. The file stem is the policy id; `monitor_ids` emits a
//! fresh snapshot on every poll tick, on `reload()`, and whenever the
//! directory listing changes in between ticks.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use autoscaler_core::{AutoscalerError, IdSnapshot, Policy, PolicySource};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct FilePolicySource {
    name: String,
    directory: PathBuf,
    poll_interval: Duration,
    reload_notify: Notify,
}

impl FilePolicySource {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            poll_interval,
            reload_notify: Notify::new(),
        }
    }

    /// Lists `*.json` files in the directory, returning `(id, path)` pairs
    /// sorted by id for deterministic snapshots.
    fn list_documents(&self) -> Result<Vec<(String, PathBuf)>, std::io::Error> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            out.push((stem.to_string(), path));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn read_policy(&self, path: &PathBuf) -> Result<Policy, String> {
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        serde_json::from_str(&content).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn monitor_ids(
        &self,
        cancel: CancellationToken,
        results: mpsc::Sender<IdSnapshot>,
        errors: mpsc::Sender<AutoscalerError>,
    ) {
        loop {
            match self.list_documents() {
                Ok(docs) => {
                    let ids = docs.into_iter().map(|(id, _)| id).collect();
                    if results
                        .send(IdSnapshot {
                            source: self.name.clone(),
                            ids,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    let _ = errors
                        .send(AutoscalerError::Io(e))
                        .await;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.reload_notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn monitor_policy(
        &self,
        cancel: CancellationToken,
        id: String,
        results: mpsc::Sender<Policy>,
        errors: mpsc::Sender<AutoscalerError>,
    ) {
        let mut last_sent: Option<String> = None;
        loop {
            match self.list_documents() {
                Ok(docs) => {
                    if let Some((_, path)) = docs.iter().find(|(doc_id, _)| doc_id == &id) {
                        match self.read_policy(path) {
                            Ok(policy) => {
                                let raw = serde_json::to_string(&policy).unwrap_or_default();
                                if last_sent.as_deref() != Some(raw.as_str()) {
                                    if results.send(policy).await.is_err() {
                                        return;
                                    }
                                    last_sent = Some(raw);
                                }
                            }
                            Err(message) => {
                                warn!(policy = %id, error = %message, "failed to parse policy document");
                                let _ = errors
                                    .send(AutoscalerError::InvalidPolicy { id: id.clone(), message })
                                    .await;
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = errors.send(AutoscalerError::Io(e)).await;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.reload_notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn reload(&self) {
        self.reload_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("autoscaler-policy-source-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_policy(dir: &std::path::Path, id: &str, min: i64, max: i64) {
        let path = dir.join(format!("{id}.json"));
        let mut f = std::fs::File::create(path).unwrap();
        write!(
            f,
            r#"{{
                "id": "{id}",
                "enabled": true,
                "type": "horizontal",
                "min": {min},
                "max": {max},
                "cooldown": 60,
                "evaluation_interval": 10,
                "on_check_error": "fail",
                "target": {{"name": "test-target", "config": {{}}}},
                "checks": []
            }}"#
        )
        .unwrap();
    }

    #[tokio::test]
    async fn monitor_ids_lists_json_files_by_stem() {
        let dir = tempdir();
        write_policy(&dir, "web", 1, 5);
        write_policy(&dir, "api", 1, 5);

        let source = FilePolicySource::new("files", dir.clone(), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            source.monitor_ids(cancel_clone, tx, err_tx).await;
        });

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.source, "files");
        assert_eq!(snapshot.ids, vec!["api".to_string(), "web".to_string()]);

        cancel.cancel();
        let _ = handle.await;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn monitor_policy_only_resends_on_change() {
        let dir = tempdir();
        write_policy(&dir, "web", 1, 5);

        let source = FilePolicySource::new("files", dir.clone(), Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);
        let (err_tx, _err_rx) = mpsc::channel(4);

        let cancel_clone = cancel.clone();
        let dir_path = dir.clone();
        let handle = tokio::spawn(async move {
            source.monitor_policy(cancel_clone, "web".to_string(), tx, err_tx).await;
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.max, 5);

        write_policy(&dir_path, "web", 1, 9);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.max, 9);

        cancel.cancel();
        let _ = handle.await;
        std::fs::remove_dir_all(&dir).ok();
    }
}

use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts::remove_dir_if_exists;
use crate::error::Result;
use crate::store::SharedStore;

/// Deletes uploads that are past expiry and referenced by no run.
///
/// An upload referenced by any run, in any status, is never reaped. Uploads
/// pinned by an in-flight run creation are skipped until the pin is released;
/// an expired upload cannot be newly pinned, so a listed upload stays
/// unclaimed while its files are removed.
pub struct UploadReaper {
    store: SharedStore,
    uploads_dir: PathBuf,
    interval: Duration,
}

impl UploadReaper {
    pub fn new(store: SharedStore, uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            uploads_dir: uploads_dir.into(),
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        // a zero period would panic
        let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Upload reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.reap_once().await {
                        Ok(removed) if !removed.is_empty() => {
                            tracing::info!(count = removed.len(), "Reaped expired uploads");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "Upload reaper tick failed"),
                    }
                }
            }
        }

        tracing::info!("Upload reaper stopped");
    }

    /// One pass; returns the ids removed. An upload whose files cannot be
    /// removed keeps its record and is retried on the next pass.
    pub async fn reap_once(&self) -> Result<Vec<Uuid>> {
        let expired = self.store.read().await.expired_unreferenced_uploads();
        let mut removed = Vec::with_capacity(expired.len());

        for upload in expired {
            let dir = self.uploads_dir.join(upload.id.to_string());
            if let Err(e) = remove_dir_if_exists(&dir).await {
                tracing::warn!(
                    upload_id = %upload.id,
                    path = %dir.display(),
                    error = %e,
                    "Cannot remove expired upload"
                );
                continue;
            }

            if self.store.write().await.delete_upload(&upload.id) {
                tracing::debug!(upload_id = %upload.id, name = %upload.name, "Upload reaped");
                removed.push(upload.id);
            }
        }

        Ok(removed)
    }
}

//! Operations exposed to the HTTP and CLI layers.
//!
//! [`PrecheckService`] combines the state store, the container runtime and
//! the storage tree. Run status is only written here for cancellation; every
//! other transition belongs to the queue processor.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde::Serialize;
use uuid::Uuid;

use crate::artifacts::{archive_dir, find_output, remove_dir_if_exists, INPUT_FILE};
use crate::checksum::ChecksumWriter;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{PrecheckError, Result};
use crate::runtime::{ContainerRecord, ContainerRuntime, LogOptions};
use crate::scheduler::orphan;
use crate::store::{NewRun, Run, RunStatus, RunUpdate, SharedStore, Upload, DEFAULT_DIE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
}

/// A slice of a run's output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogChunk {
    pub lines: Vec<String>,
    /// Unix seconds the chunk starts from, 0 for "from the beginning"
    pub since: i64,
    /// Timestamp of the last line when timestamps were requested, else `since`
    pub last_timestamp: i64,
    /// The tail limit was hit; older lines exist
    pub has_more: bool,
}

impl LogChunk {
    fn empty(since: i64) -> Self {
        Self {
            lines: Vec::new(),
            since,
            last_timestamp: since,
            has_more: false,
        }
    }

    fn parse(text: &str, options: &LogOptions) -> Self {
        let since = options.since.unwrap_or(0);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::empty(since);
        }

        let lines: Vec<String> = trimmed.lines().map(str::to_string).collect();
        let last_timestamp = if options.timestamps {
            lines
                .last()
                .and_then(|line| line.split_whitespace().next())
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.timestamp())
                .unwrap_or(since)
        } else {
            since
        };
        let has_more = options.tail.is_some_and(|tail| tail > 0 && lines.len() == tail);

        Self {
            lines,
            since,
            last_timestamp,
            has_more,
        }
    }
}

#[derive(Clone)]
pub struct PrecheckService {
    store: SharedStore,
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
    uploads_dir: PathBuf,
    runs_dir: PathBuf,
    max_concurrent: usize,
    stop_timeout: Duration,
    wait_poll_interval: Duration,
}

impl PrecheckService {
    pub fn new(
        config: &Config,
        store: SharedStore,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            runtime,
            clock,
            uploads_dir: config.server.uploads_dir(),
            runs_dir: config.server.runs_dir(),
            max_concurrent: config.server.max_concurrent,
            stop_timeout: config.docker.stop_timeout(),
            wait_poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval;
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    /// Store `data` as `uploads/<id>/input.gds` and record it.
    pub async fn create_upload(&self, data: &[u8], name: Option<&str>) -> Result<Upload> {
        let id = Uuid::new_v4();
        let dir = self.uploads_dir.join(id.to_string());
        let path = dir.join(INPUT_FILE);
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(INPUT_FILE)
            .to_string();

        let mut digest = ChecksumWriter::new();
        digest.update(data);

        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, data).await
        }
        .await;
        if let Err(e) = written {
            let _ = remove_dir_if_exists(&dir).await;
            return Err(e.into());
        }

        let size = digest.size();
        let upload = self
            .store
            .write()
            .await
            .create_upload(id, name, path, size, digest.finish());
        tracing::info!(upload_id = %upload.id, name = %upload.name, size = upload.size, "Upload stored");
        Ok(upload)
    }

    pub async fn get_upload(&self, id: Uuid) -> Result<Upload> {
        self.store
            .read()
            .await
            .get_upload(&id)
            .ok_or(PrecheckError::UploadNotFound(id))
    }

    pub async fn list_uploads(&self) -> Vec<Upload> {
        self.store.read().await.list_uploads()
    }

    /// Remove the upload's files, then its record. Runs keep their own copy.
    pub async fn delete_upload(&self, id: Uuid) -> Result<()> {
        self.get_upload(id).await?;
        remove_dir_if_exists(&self.uploads_dir.join(id.to_string())).await?;
        self.store.write().await.delete_upload(&id);
        tracing::info!(upload_id = %id, "Upload deleted");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Queue a precheck of `upload_id`.
    ///
    /// The upload's layout is copied into a fresh run directory before the
    /// run row exists; the upload stays pinned for the duration so the
    /// reaper cannot remove it mid-copy.
    ///
    /// Pin, copy and insert run on a spawned task, so dropping the returned
    /// future still finishes the run or cleans up after it and releases the
    /// pin.
    pub async fn create_run(
        &self,
        upload_id: Uuid,
        top_cell: &str,
        die_id: Option<&str>,
    ) -> Result<Run> {
        let top_cell = top_cell.trim();
        if top_cell.is_empty() {
            return Err(PrecheckError::InvalidRequest(
                "top_cell must not be empty".to_string(),
            ));
        }
        let die_id = die_id
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or(DEFAULT_DIE_ID)
            .to_string();
        let top_cell = top_cell.to_string();

        let service = self.clone();
        let staging = tokio::spawn(async move {
            let upload = service.store.write().await.pin_upload(&upload_id)?;
            let created = service.stage_run(&upload, &top_cell, &die_id).await;
            service.store.write().await.unpin_upload(&upload_id);
            created
        });
        let run = staging.await.map_err(std::io::Error::other)??;
        tracing::info!(
            run_id = %run.id,
            upload_id = %upload_id,
            top_cell = %run.top_cell,
            position = ?run.queue_position,
            "Run queued"
        );
        Ok(run)
    }

    async fn stage_run(&self, upload: &Upload, top_cell: &str, die_id: &str) -> Result<Run> {
        let id = Uuid::new_v4();
        let dir = self.runs_dir.join(id.to_string());

        let staged = async {
            tokio::fs::create_dir_all(&dir).await?;
            // bind mounts need an absolute path
            let dir = tokio::fs::canonicalize(&dir).await?;
            tokio::fs::copy(&upload.path, dir.join(INPUT_FILE)).await?;
            Ok::<PathBuf, std::io::Error>(dir)
        }
        .await;

        let run_dir = match staged {
            Ok(run_dir) => run_dir,
            Err(e) => {
                let _ = remove_dir_if_exists(&dir).await;
                return Err(e.into());
            }
        };

        let created = self.store.write().await.create_run(NewRun {
            id,
            upload_id: upload.id,
            top_cell: top_cell.to_string(),
            die_id: die_id.to_string(),
            run_dir: run_dir.clone(),
        });
        if created.is_err() {
            let _ = remove_dir_if_exists(&run_dir).await;
        }
        created
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Run> {
        self.store
            .read()
            .await
            .get_run(&id)
            .ok_or(PrecheckError::RunNotFound(id))
    }

    /// Runs newest first, optionally restricted to `statuses`.
    pub async fn list_runs(&self, statuses: &[RunStatus]) -> Vec<Run> {
        self.store.read().await.list_runs(statuses)
    }

    /// Cancel a run. Terminal runs are returned unchanged.
    ///
    /// A queued run is cancelled in one store operation. For a running run
    /// the cancel is recorded before its container is stopped; while it is
    /// pending, reconciliation cannot record an exit as the run's outcome.
    /// If stopping fails, the pending cancel is dropped, the run is left
    /// running and the runtime error is returned.
    pub async fn cancel_run(&self, id: Uuid) -> Result<Run> {
        let running = {
            let mut store = self.store.write().await;
            let run = store.begin_cancel(&id)?;
            match run.status {
                status if status.is_terminal() => return Ok(run),
                RunStatus::Queued => {
                    let run = store.update_run(
                        &id,
                        RunUpdate::status(RunStatus::Cancelled).with_finished_at(self.clock.now()),
                    )?;
                    tracing::info!(run_id = %id, "Queued run cancelled");
                    return Ok(run);
                }
                _ => run,
            }
        };

        if let Some(handle) = &running.container_id {
            if let Err(e) = self.runtime.stop_and_remove(handle, self.stop_timeout).await {
                self.store.write().await.abort_cancel(&id);
                tracing::warn!(run_id = %id, container = %handle, error = %e, "Cancel failed, container still running");
                return Err(e.into());
            }
        }

        let mut store = self.store.write().await;
        let update = RunUpdate::status(RunStatus::Cancelled).with_finished_at(self.clock.now());
        match store.update_run(&id, update) {
            Ok(run) => {
                tracing::info!(run_id = %id, container = ?running.container_id, "Running run cancelled");
                Ok(run)
            }
            // a concurrent cancel got there first
            Err(PrecheckError::InvalidTransition { .. }) => {
                store.get_run(&id).ok_or(PrecheckError::RunNotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a run's record and working directory together.
    ///
    /// A queued or running run is rejected with [`PrecheckError::RunActive`]
    /// unless `force` is set, in which case it is cancelled first.
    pub async fn delete_run(&self, id: Uuid, force: bool) -> Result<()> {
        let run = self.get_run(id).await?;
        if !run.status.is_terminal() {
            if !force {
                return Err(PrecheckError::RunActive {
                    id,
                    status: run.status,
                });
            }
            self.cancel_run(id).await?;
        }

        remove_dir_if_exists(&run.run_dir).await?;
        self.store.write().await.delete_run(&id);
        tracing::info!(run_id = %id, "Run deleted");
        Ok(())
    }

    /// Output of the run's container. Empty until the run is dispatched, and
    /// once the container has been removed.
    pub async fn get_logs(&self, id: Uuid, options: &LogOptions) -> Result<LogChunk> {
        let run = self.get_run(id).await?;
        let since = options.since.unwrap_or(0);
        let Some(handle) = run.container_id else {
            return Ok(LogChunk::empty(since));
        };

        match self.runtime.logs(&handle, options).await? {
            Some(text) => Ok(LogChunk::parse(&text, options)),
            None => Ok(LogChunk::empty(since)),
        }
    }

    pub async fn get_stats(&self, id: Uuid) -> Result<serde_json::Value> {
        let run = self.get_run(id).await?;
        let handle = match (run.status, run.container_id) {
            (RunStatus::Running, Some(handle)) => handle,
            _ => return Err(PrecheckError::NotRunning(id)),
        };
        self.runtime
            .stats(&handle)
            .await?
            .ok_or(PrecheckError::NotRunning(id))
    }

    /// Poll until the run is terminal. Read-only; on deadline fails with
    /// [`PrecheckError::Timeout`] carrying the last observed status.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let run = self.get_run(id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(PrecheckError::Timeout {
                    id,
                    status: run.status,
                });
            }
            tokio::time::sleep(self.wait_poll_interval.min(deadline - now)).await;
        }
    }

    /// Path of the completed run's output layout.
    pub async fn output_artifact(&self, id: Uuid) -> Result<PathBuf> {
        let run = self.get_run(id).await?;
        if run.status != RunStatus::Completed {
            return Err(PrecheckError::NotCompleted {
                id,
                status: run.status,
            });
        }

        let found = tokio::task::spawn_blocking(move || find_output(&run.run_dir, &run.top_cell))
            .await
            .map_err(std::io::Error::other)?;
        found.ok_or(PrecheckError::OutputMissing(id))
    }

    /// Gzip'd tarball of the whole run directory, rooted at `<run id>/`.
    pub async fn debug_archive(&self, id: Uuid) -> Result<Vec<u8>> {
        let run = self.get_run(id).await?;
        if !is_dir(&run.run_dir).await {
            return Err(PrecheckError::RunNotFound(id));
        }

        let root = id.to_string();
        let bytes = tokio::task::spawn_blocking(move || archive_dir(&run.run_dir, &root))
            .await
            .map_err(std::io::Error::other)??;
        Ok(bytes)
    }

    /// Queue depth and occupancy. Running counts live containers, falling
    /// back to the store when the runtime cannot be reached.
    pub async fn queue_status(&self) -> QueueStatus {
        let (queued, tracked_running) = {
            let store = self.store.read().await;
            (store.queue_length(), store.running_count())
        };
        let running = match self.runtime.count_running().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot count running containers");
                tracked_running
            }
        };
        QueueStatus {
            queued,
            running,
            max_concurrent: self.max_concurrent,
        }
    }

    // ---------------------------------------------------------------------
    // Admin
    // ---------------------------------------------------------------------

    pub async fn list_orphans(&self) -> Result<Vec<ContainerRecord>> {
        let tracked = self.tracked_containers().await;
        orphan::find_orphans(self.runtime.as_ref(), &tracked).await
    }

    pub async fn cleanup_orphans(&self) -> Result<Vec<String>> {
        let tracked = self.tracked_containers().await;
        orphan::cleanup(self.runtime.as_ref(), &tracked, self.stop_timeout).await
    }

    /// Containers bound to non-terminal runs.
    async fn tracked_containers(&self) -> HashSet<String> {
        self.store
            .read()
            .await
            .running_runs()
            .into_iter()
            .filter_map(|r| r.container_id)
            .collect()
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::checksum::Checksums;
use crate::clock::Clock;
use crate::error::{PrecheckError, Result};
use crate::store::models::{NewRun, Run, RunStatus, RunUpdate, Upload};

/// Session-scoped record of uploads and runs.
///
/// In-memory; it starts empty for every server session. The queue is not a separate structure but the set of `queued`
/// runs ordered by `(created_at, id)`.
///
/// Callers share it as [`SharedStore`]; every method runs under one lock
/// acquisition, which is what makes each operation atomic.
#[derive(Debug)]
pub struct StateStore {
    uploads: HashMap<Uuid, Upload>,
    runs: HashMap<Uuid, Run>,
    /// Uploads held by a run creation that is still copying the artifact.
    pins: HashMap<Uuid, usize>,
    /// Running runs whose container is being stopped by a cancel request.
    cancelling: HashSet<Uuid>,
    upload_ttl: Duration,
    clock: Arc<dyn Clock>,
}

pub type SharedStore = Arc<tokio::sync::RwLock<StateStore>>;

impl StateStore {
    pub fn new(upload_ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            uploads: HashMap::new(),
            runs: HashMap::new(),
            pins: HashMap::new(),
            cancelling: HashSet::new(),
            upload_ttl,
            clock,
        }
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(tokio::sync::RwLock::new(self))
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---------------------------------------------------------------------
    // Uploads
    // ---------------------------------------------------------------------

    pub fn create_upload(
        &mut self,
        id: Uuid,
        name: String,
        path: PathBuf,
        size: u64,
        checksums: Checksums,
    ) -> Upload {
        let now = self.clock.now();
        let upload = Upload {
            id,
            name,
            path,
            size,
            checksums,
            created_at: now,
            expires_at: now + self.upload_ttl,
            expired: false,
        };
        self.uploads.insert(id, upload.clone());
        upload
    }

    pub fn get_upload(&self, id: &Uuid) -> Option<Upload> {
        self.uploads.get(id).map(|u| self.annotate_upload(u))
    }

    /// All uploads, newest first.
    pub fn list_uploads(&self) -> Vec<Upload> {
        let mut uploads: Vec<Upload> = self
            .uploads
            .values()
            .map(|u| self.annotate_upload(u))
            .collect();
        uploads.sort_by_key(|u| Reverse((u.created_at, u.id)));
        uploads
    }

    pub fn delete_upload(&mut self, id: &Uuid) -> bool {
        self.uploads.remove(id).is_some()
    }

    /// Uploads past expiry that no run references and no run creation holds.
    pub fn expired_unreferenced_uploads(&self) -> Vec<Upload> {
        let now = self.clock.now();
        let mut expired: Vec<Upload> = self
            .uploads
            .values()
            .filter(|u| u.is_expired_at(now))
            .filter(|u| !self.is_upload_referenced(&u.id))
            .filter(|u| !self.is_upload_pinned(&u.id))
            .map(|u| self.annotate_upload(u))
            .collect();
        expired.sort_by_key(|u| (u.created_at, u.id));
        expired
    }

    pub fn is_upload_referenced(&self, id: &Uuid) -> bool {
        self.runs.values().any(|r| r.upload_id == *id)
    }

    /// Hold an upload while its artifact is copied into a new run directory.
    ///
    /// Fails if the upload is absent or already expired. Every successful pin
    /// must be paired with [`StateStore::unpin_upload`].
    pub fn pin_upload(&mut self, id: &Uuid) -> Result<Upload> {
        let upload = self
            .get_upload(id)
            .ok_or(PrecheckError::UploadNotFound(*id))?;
        if upload.expired {
            return Err(PrecheckError::Expired(*id));
        }
        *self.pins.entry(*id).or_insert(0) += 1;
        Ok(upload)
    }

    pub fn unpin_upload(&mut self, id: &Uuid) {
        if let Some(count) = self.pins.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(id);
            }
        }
    }

    pub fn is_upload_pinned(&self, id: &Uuid) -> bool {
        self.pins.contains_key(id)
    }

    fn annotate_upload(&self, upload: &Upload) -> Upload {
        let mut upload = upload.clone();
        upload.expired = upload.is_expired_at(self.clock.now());
        upload
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Insert a queued run. The upload's checksums are copied into the run so
    /// they survive the upload being deleted later.
    pub fn create_run(&mut self, new: NewRun) -> Result<Run> {
        let upload = self
            .uploads
            .get(&new.upload_id)
            .ok_or(PrecheckError::UploadNotFound(new.upload_id))?;

        let run = Run {
            id: new.id,
            upload_id: new.upload_id,
            top_cell: new.top_cell,
            die_id: new.die_id,
            run_dir: new.run_dir,
            created_at: self.clock.now(),
            status: RunStatus::Queued,
            container_id: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            input_checksums: upload.checksums.clone(),
            output_checksums: None,
            queue_position: None,
        };
        self.runs.insert(run.id, run);

        self.get_run(&new.id)
            .ok_or(PrecheckError::RunNotFound(new.id))
    }

    pub fn get_run(&self, id: &Uuid) -> Option<Run> {
        let mut run = self.runs.get(id)?.clone();
        run.queue_position = self.queue_position(id);
        Some(run)
    }

    /// Runs newest first. An empty filter returns every run.
    pub fn list_runs(&self, statuses: &[RunStatus]) -> Vec<Run> {
        let positions = self.queue_positions();
        let mut runs: Vec<Run> = self
            .runs
            .values()
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .map(|r| {
                let mut run = r.clone();
                run.queue_position = positions.get(&r.id).copied();
                run
            })
            .collect();
        runs.sort_by_key(|r| Reverse(r.queue_key()));
        runs
    }

    /// Apply the `Some` fields of `update`.
    ///
    /// Terminal runs are immutable, status changes must follow the state
    /// machine, and a container handle may only be attached to a running run.
    /// While a cancel is pending the only accepted outcome is `cancelled`.
    pub fn update_run(&mut self, id: &Uuid, update: RunUpdate) -> Result<Run> {
        let run = self
            .runs
            .get_mut(id)
            .ok_or(PrecheckError::RunNotFound(*id))?;

        let target = update.status.unwrap_or(run.status);
        let invalid = PrecheckError::InvalidTransition {
            id: *id,
            from: run.status,
            to: target,
        };

        if run.status.is_terminal() {
            return Err(invalid);
        }
        if self.cancelling.contains(id)
            && target != run.status
            && target != RunStatus::Cancelled
        {
            return Err(invalid);
        }
        if target != run.status && !run.status.can_transition_to(target) {
            return Err(invalid);
        }
        if target == RunStatus::Running
            && run.container_id.is_none()
            && update.container_id.is_none()
        {
            return Err(invalid);
        }
        if update.container_id.is_some() && target != RunStatus::Running {
            return Err(invalid);
        }

        run.status = target;
        if let Some(container_id) = update.container_id {
            run.container_id = Some(container_id);
        }
        if let Some(at) = update.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = update.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(code) = update.exit_code {
            run.exit_code = Some(code);
        }
        if let Some(error) = update.error {
            run.error = Some(error);
        }
        if let Some(sums) = update.output_checksums {
            run.output_checksums = Some(sums);
        }
        if run.status.is_terminal() {
            self.cancelling.remove(id);
        }

        self.get_run(id).ok_or(PrecheckError::RunNotFound(*id))
    }

    /// Conditional `queued -> running` claim: fails with `InvalidTransition`
    /// if the run is no longer queued (e.g. cancelled since it was picked).
    pub fn mark_running(&mut self, id: &Uuid, container_id: String) -> Result<Run> {
        let status = self
            .runs
            .get(id)
            .map(|r| r.status)
            .ok_or(PrecheckError::RunNotFound(*id))?;
        if status != RunStatus::Queued {
            return Err(PrecheckError::InvalidTransition {
                id: *id,
                from: status,
                to: RunStatus::Running,
            });
        }
        let now = self.clock.now();
        self.update_run(
            id,
            RunUpdate::status(RunStatus::Running)
                .with_container(container_id)
                .with_started_at(now),
        )
    }

    /// Record that a running run's container is about to be stopped on
    /// request. Until [`StateStore::abort_cancel`] or the run reaches a
    /// terminal state, reconciliation cannot record another outcome for it.
    ///
    /// Returns the run as it is now; only a `running` run is marked.
    pub fn begin_cancel(&mut self, id: &Uuid) -> Result<Run> {
        let run = self.get_run(id).ok_or(PrecheckError::RunNotFound(*id))?;
        if run.status == RunStatus::Running {
            self.cancelling.insert(*id);
        }
        Ok(run)
    }

    /// Drop a pending cancel whose container could not be stopped.
    pub fn abort_cancel(&mut self, id: &Uuid) {
        self.cancelling.remove(id);
    }

    pub fn is_cancelling(&self, id: &Uuid) -> bool {
        self.cancelling.contains(id)
    }

    pub fn delete_run(&mut self, id: &Uuid) -> bool {
        self.cancelling.remove(id);
        self.runs.remove(id).is_some()
    }

    /// The oldest queued run, if any.
    pub fn next_queued_run(&self) -> Option<Run> {
        let id = self
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Queued)
            .min_by_key(|r| r.queue_key())?
            .id;
        self.get_run(&id)
    }

    pub fn running_runs(&self) -> Vec<Run> {
        self.list_runs(&[RunStatus::Running])
    }

    pub fn running_count(&self) -> usize {
        self.count_with_status(RunStatus::Running)
    }

    /// 1-indexed position among queued runs, `None` unless the run is queued.
    pub fn queue_position(&self, id: &Uuid) -> Option<usize> {
        let run = self.runs.get(id)?;
        if run.status != RunStatus::Queued {
            return None;
        }
        let key = run.queue_key();
        let ahead = self
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Queued && r.queue_key() < key)
            .count();
        Some(ahead + 1)
    }

    pub fn queue_length(&self) -> usize {
        self.count_with_status(RunStatus::Queued)
    }

    fn count_with_status(&self, status: RunStatus) -> usize {
        self.runs.values().filter(|r| r.status == status).count()
    }

    fn queue_positions(&self) -> HashMap<Uuid, usize> {
        let mut queued: Vec<&Run> = self
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Queued)
            .collect();
        queued.sort_by_key(|r| r.queue_key());
        queued
            .into_iter()
            .enumerate()
            .map(|(i, r)| (r.id, i + 1))
            .collect()
    }
}

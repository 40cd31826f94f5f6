use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::artifacts::find_output;
use crate::checksum::{checksum_file, Checksums};
use crate::clock::Clock;
use crate::error::{PrecheckError, Result};
use crate::runtime::{ContainerRuntime, ContainerStatus, LaunchSpec};
use crate::store::{Run, RunStatus, RunUpdate, SharedStore};

/// Error recorded on a running run whose container vanished.
pub const DISAPPEARED_ERROR: &str = "Container disappeared";

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Runs moved to a terminal state by reconciliation
    pub finished: Vec<(Uuid, RunStatus)>,
    /// Run admitted into `running`
    pub admitted: Option<Uuid>,
    /// Run that failed to launch
    pub launch_failed: Option<Uuid>,
}

/// Drives runs through their lifecycle.
///
/// This is the only writer of run status after creation (apart from
/// cancellation). Every tick has two phases, in this order:
///
/// ## 1. Reconcile running runs
/// Each `running` run's container is inspected. A vanished container fails
/// the run; an exited one completes (exit code 0) or fails it, records the
/// output checksum when the output layout exists, and the container is
/// removed.
///
/// ## 2. Admit queued work
/// If the number of occupied slots is below the concurrency budget, the
/// oldest queued run is launched. A launch failure fails the run directly;
/// it never becomes `running`.
///
/// Reconciling first means slots freed this tick are available to admission.
pub struct QueueProcessor {
    store: SharedStore,
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    poll_interval: Duration,
    stop_timeout: Duration,
}

impl QueueProcessor {
    pub fn new(
        store: SharedStore,
        runtime: Arc<dyn ContainerRuntime>,
        clock: Arc<dyn Clock>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            runtime,
            clock,
            max_concurrent,
            poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Tick until `shutdown` is cancelled. A failed tick is logged and the
    /// loop carries on.
    pub async fn run(&self, shutdown: CancellationToken) {
        // a zero period would panic
        let mut interval = tokio::time::interval(self.poll_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            max_concurrent = self.max_concurrent,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Queue processor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.process_once().await {
                        tracing::error!(error = %e, "Queue processor tick failed");
                    }
                }
            }
        }

        tracing::info!("Queue processor stopped");
    }

    /// One reconcile-then-admit pass.
    pub async fn process_once(&self) -> Result<TickReport> {
        let mut report = TickReport {
            finished: self.reconcile_running().await?,
            ..Default::default()
        };
        self.admit_next(&mut report).await?;
        Ok(report)
    }

    async fn reconcile_running(&self) -> Result<Vec<(Uuid, RunStatus)>> {
        let running: Vec<Run> = {
            let store = self.store.read().await;
            // runs being cancelled belong to the cancel request
            store
                .running_runs()
                .into_iter()
                .filter(|r| !store.is_cancelling(&r.id))
                .collect()
        };
        let mut finished = Vec::new();

        for run in running {
            let Some(handle) = run.container_id.clone() else {
                // running without a handle cannot be reconciled; treat as lost
                if self.finish_disappeared(&run).await? {
                    finished.push((run.id, RunStatus::Failed));
                }
                continue;
            };

            match self.runtime.status(&handle).await {
                Ok(None) => {
                    if self.finish_disappeared(&run).await? {
                        finished.push((run.id, RunStatus::Failed));
                    }
                }
                Ok(Some(status)) if status.exited => {
                    if let Some(final_status) = self.finish_exited(&run, &status).await? {
                        finished.push((run.id, final_status));
                    }
                    match self.runtime.stop_and_remove(&handle, self.stop_timeout).await {
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(run_id = %run.id, container = %handle, error = %e, "Failed to remove finished container");
                        }
                    }
                }
                Ok(Some(_)) => {}
                Err(e) => {
                    // the runtime call failed; the container may well be alive
                    tracing::warn!(run_id = %run.id, container = %handle, error = %e, "Container status unavailable");
                }
            }
        }

        Ok(finished)
    }

    async fn finish_disappeared(&self, run: &Run) -> Result<bool> {
        tracing::warn!(run_id = %run.id, container = ?run.container_id, "Container disappeared");
        let update = RunUpdate::status(RunStatus::Failed)
            .with_error(DISAPPEARED_ERROR)
            .with_finished_at(self.clock.now());
        self.apply(run.id, update).await
    }

    async fn finish_exited(
        &self,
        run: &Run,
        status: &ContainerStatus,
    ) -> Result<Option<RunStatus>> {
        let final_status = if status.exit_code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };

        let output_checksums = if final_status == RunStatus::Completed {
            self.output_checksums(run).await
        } else {
            None
        };

        let error = match (&status.error, final_status) {
            (Some(e), _) => Some(e.clone()),
            (None, RunStatus::Failed) => Some(format!("Exit code: {}", status.exit_code)),
            (None, _) => None,
        };

        let mut update = RunUpdate::status(final_status)
            .with_exit_code(status.exit_code)
            .with_finished_at(status.finished_at.unwrap_or_else(|| self.clock.now()))
            .with_output_checksums(output_checksums.clone());
        update.error = error;

        if !self.apply(run.id, update).await? {
            return Ok(None);
        }

        if final_status == RunStatus::Completed && output_checksums.is_none() {
            tracing::warn!(run_id = %run.id, top_cell = %run.top_cell, "Run completed without an output layout");
        }
        tracing::info!(
            run_id = %run.id,
            status = %final_status,
            exit_code = status.exit_code,
            "Run finished"
        );
        Ok(Some(final_status))
    }

    async fn output_checksums(&self, run: &Run) -> Option<Checksums> {
        let run_dir = run.run_dir.clone();
        let top_cell = run.top_cell.clone();
        let run_id = run.id;

        let hashed = tokio::task::spawn_blocking(move || {
            find_output(&run_dir, &top_cell)
                .map(|path| checksum_file(&path))
                .transpose()
        })
        .await;

        match hashed {
            Ok(Ok(sums)) => sums,
            Ok(Err(e)) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to hash output layout");
                None
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Output hashing task failed");
                None
            }
        }
    }

    async fn admit_next(&self, report: &mut TickReport) -> Result<()> {
        let running = match self.runtime.count_running().await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot count running containers, skipping admission");
                return Ok(());
            }
        };

        // Live containers are authoritative, but a run whose container exited
        // after reconciliation still holds its slot until the next tick.
        let (occupied, next) = {
            let store = self.store.read().await;
            (running.max(store.running_count()), store.next_queued_run())
        };
        if occupied >= self.max_concurrent {
            return Ok(());
        }
        let Some(run) = next else {
            return Ok(());
        };

        let spec = LaunchSpec {
            run_id: run.id,
            work_dir: run.run_dir.clone(),
            top_cell: run.top_cell.clone(),
            die_id: run.die_id.clone(),
        };

        match self.runtime.start(&spec).await {
            Ok(handle) => {
                let claimed = self
                    .store
                    .write()
                    .await
                    .mark_running(&run.id, handle.clone());
                match claimed {
                    Ok(_) => {
                        tracing::info!(run_id = %run.id, container = %handle, "Run admitted");
                        report.admitted = Some(run.id);
                    }
                    Err(PrecheckError::InvalidTransition { from, .. }) => {
                        // cancelled or deleted between selection and launch
                        tracing::info!(run_id = %run.id, status = %from, "Run left the queue during launch, removing container");
                        self.discard_container(&run.id, &handle).await;
                    }
                    Err(PrecheckError::RunNotFound(_)) => {
                        tracing::info!(run_id = %run.id, "Run deleted during launch, removing container");
                        self.discard_container(&run.id, &handle).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Failed to launch container");
                let update = RunUpdate::status(RunStatus::Failed)
                    .with_error(e.to_string())
                    .with_finished_at(self.clock.now());
                if self.apply(run.id, update).await? {
                    report.launch_failed = Some(run.id);
                }
            }
        }

        Ok(())
    }

    async fn discard_container(&self, run_id: &Uuid, handle: &str) {
        if let Err(e) = self.runtime.stop_and_remove(handle, self.stop_timeout).await {
            tracing::warn!(run_id = %run_id, container = %handle, error = %e, "Failed to remove container");
        }
    }

    /// Apply an update, tolerating a run that moved on concurrently (cancelled
    /// or deleted). Returns whether the update was applied.
    async fn apply(&self, id: Uuid, update: RunUpdate) -> Result<bool> {
        match self.store.write().await.update_run(&id, update) {
            Ok(_) => Ok(true),
            Err(PrecheckError::InvalidTransition { from, to, .. }) => {
                tracing::debug!(run_id = %id, %from, %to, "Run changed concurrently, update skipped");
                Ok(false)
            }
            Err(PrecheckError::RunNotFound(_)) => {
                tracing::debug!(run_id = %id, "Run deleted concurrently, update skipped");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

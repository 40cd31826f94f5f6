//! Test harness for scheduler, service and API integration tests.
//!
//! Provides an in-memory container runtime, a manual clock and a temporary
//! storage root wired together the way a server session wires them.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use uuid::Uuid;

use precheck_server::api::{self, AppState, AuthPolicy};
use precheck_server::clock::ManualClock;
use precheck_server::config::Config;
use precheck_server::runtime::{
    ContainerRecord, ContainerRuntime, ContainerStatus, LaunchSpec, LogOptions, RuntimeError,
    RuntimeResult,
};
use precheck_server::scheduler::{QueueProcessor, UploadReaper};
use precheck_server::server::prepare_storage;
use precheck_server::service::PrecheckService;
use precheck_server::store::{Run, SharedStore, StateStore, Upload};

pub const PREFIX: &str = "precheck-";

#[derive(Debug, Clone)]
struct FakeContainer {
    name: String,
    spec: Option<LaunchSpec>,
    status: ContainerStatus,
    logs: String,
    stats: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    next_id: u64,
    starts: usize,
    fail_next_start: Option<String>,
    fail_status: bool,
    fail_stop: bool,
    fail_count: bool,
    stop_delay: Option<Duration>,
    peak_running: usize,
}

impl FakeState {
    fn running(&self) -> usize {
        self.containers
            .values()
            .filter(|c| c.status.running)
            .count()
    }
}

/// In-memory [`ContainerRuntime`]. Containers start running and stay that
/// way until a test makes them exit or vanish.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    fn running_status() -> ContainerStatus {
        ContainerStatus {
            running: true,
            exited: false,
            exit_code: 0,
            error: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// A managed container nobody launched in this session.
    pub fn add_orphan(&self, name: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("orphan{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                spec: None,
                status: Self::running_status(),
                logs: String::new(),
                stats: None,
            },
        );
        id
    }

    /// Make the container exit with `code`.
    pub fn exit(&self, handle: &str, code: i32) {
        let mut state = self.lock();
        let container = state.containers.get_mut(handle).expect("unknown container");
        container.status.running = false;
        container.status.exited = true;
        container.status.exit_code = code;
        container.status.finished_at = Some(Utc::now());
    }

    /// Write the output layout the precheck flow would produce, then exit 0.
    pub fn complete_with_output(&self, handle: &str, contents: &[u8]) -> PathBuf {
        let spec = self
            .lock()
            .containers
            .get(handle)
            .and_then(|c| c.spec.clone())
            .expect("container has no launch spec");
        let step = spec
            .work_dir
            .join(&spec.top_cell)
            .join("RUN_2024-01-15_10-30-00")
            .join("KLayout.GenerateID");
        std::fs::create_dir_all(&step).unwrap();
        let output = step.join(format!("{}.gds", spec.top_cell));
        std::fs::write(&output, contents).unwrap();
        self.exit(handle, 0);
        output
    }

    /// Remove the container behind the scheduler's back.
    pub fn vanish(&self, handle: &str) {
        self.lock().containers.remove(handle);
    }

    pub fn fail_next_start(&self, message: &str) {
        self.lock().fail_next_start = Some(message.to_string());
    }

    pub fn set_status_failing(&self, failing: bool) {
        self.lock().fail_status = failing;
    }

    pub fn set_stop_failing(&self, failing: bool) {
        self.lock().fail_stop = failing;
    }

    pub fn set_count_failing(&self, failing: bool) {
        self.lock().fail_count = failing;
    }

    /// Make stops take `delay`: the container exits with 143 at once (SIGTERM)
    /// and is only removed once the delay has passed, like `docker stop`
    /// followed by `docker rm`.
    pub fn set_stop_delay(&self, delay: Option<Duration>) {
        self.lock().stop_delay = delay;
    }

    pub fn push_logs(&self, handle: &str, text: &str) {
        if let Some(c) = self.lock().containers.get_mut(handle) {
            c.logs.push_str(text);
        }
    }

    pub fn set_stats(&self, handle: &str, stats: serde_json::Value) {
        if let Some(c) = self.lock().containers.get_mut(handle) {
            c.stats = Some(stats);
        }
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.lock().containers.contains_key(handle)
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn running_count(&self) -> usize {
        self.lock().running()
    }

    /// Highest number of simultaneously running containers ever observed.
    pub fn peak_running(&self) -> usize {
        self.lock().peak_running
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts
    }

    fn failure(command: &str) -> RuntimeError {
        RuntimeError::Timeout {
            command: command.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerRecord>> {
        Ok(self
            .lock()
            .containers
            .iter()
            .map(|(id, c)| ContainerRecord {
                id: id.clone(),
                name: c.name.clone(),
                state: if c.status.running { "running" } else { "exited" }.to_string(),
            })
            .collect())
    }

    async fn count_running(&self) -> RuntimeResult<usize> {
        let state = self.lock();
        if state.fail_count {
            return Err(Self::failure("docker ps"));
        }
        Ok(state.running())
    }

    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<String> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next_start.take() {
            return Err(RuntimeError::CommandFailed {
                command: "docker run".to_string(),
                code: Some(125),
                stderr: message,
            });
        }

        state.next_id += 1;
        state.starts += 1;
        let id = format!("fake{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: format!("{}{}", PREFIX, spec.run_id),
                spec: Some(spec.clone()),
                status: Self::running_status(),
                logs: String::new(),
                stats: None,
            },
        );
        state.peak_running = state.peak_running.max(state.running());
        Ok(id)
    }

    async fn status(&self, handle: &str) -> RuntimeResult<Option<ContainerStatus>> {
        let state = self.lock();
        if state.fail_status {
            return Err(Self::failure("docker inspect"));
        }
        Ok(state.containers.get(handle).map(|c| c.status.clone()))
    }

    async fn logs(&self, handle: &str, _options: &LogOptions) -> RuntimeResult<Option<String>> {
        Ok(self.lock().containers.get(handle).map(|c| c.logs.clone()))
    }

    async fn stats(&self, handle: &str) -> RuntimeResult<Option<serde_json::Value>> {
        Ok(self
            .lock()
            .containers
            .get(handle)
            .and_then(|c| c.stats.clone()))
    }

    async fn stop_and_remove(&self, handle: &str, _timeout: Duration) -> RuntimeResult<bool> {
        let delay = {
            let mut state = self.lock();
            if state.fail_stop {
                return Err(Self::failure("docker stop"));
            }
            let Some(delay) = state.stop_delay else {
                return Ok(state.containers.remove(handle).is_some());
            };
            let Some(container) = state.containers.get_mut(handle) else {
                return Ok(false);
            };
            container.status.running = false;
            container.status.exited = true;
            container.status.exit_code = 143;
            container.status.finished_at = Some(Utc::now());
            delay
        };
        tokio::time::sleep(delay).await;
        Ok(self.lock().containers.remove(handle).is_some())
    }
}

/// A wired-up session over a temporary storage root.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub runtime: Arc<FakeRuntime>,
    pub store: SharedStore,
    pub service: PrecheckService,
    pub processor: QueueProcessor,
    pub reaper: UploadReaper,
}

impl TestEnv {
    pub async fn new(max_concurrent: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default()
            .with_storage_path(dir.path())
            .with_max_concurrent(max_concurrent);
        prepare_storage(&config.server.uploads_dir(), &config.server.runs_dir())
            .await
            .unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap(),
        ));
        let runtime = Arc::new(FakeRuntime::new());
        let store = StateStore::new(config.server.upload_ttl(), clock.clone()).shared();

        let service = PrecheckService::new(&config, store.clone(), runtime.clone(), clock.clone())
            .with_wait_poll_interval(Duration::from_millis(10));
        let processor =
            QueueProcessor::new(store.clone(), runtime.clone(), clock.clone(), max_concurrent)
                .with_poll_interval(Duration::from_millis(10));
        let reaper = UploadReaper::new(store.clone(), config.server.uploads_dir());

        Self {
            dir,
            config,
            clock,
            runtime,
            store,
            service,
            processor,
            reaper,
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.config.server.uploads_dir()
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.config.server.runs_dir()
    }

    pub async fn upload(&self, data: &[u8]) -> Upload {
        self.service
            .create_upload(data, Some("chip.gds"))
            .await
            .unwrap()
    }

    /// Queue a run and step the clock so creation order is unambiguous.
    pub async fn queue_run(&self, upload_id: Uuid) -> Run {
        let run = self
            .service
            .create_run(upload_id, "chip_top", None)
            .await
            .unwrap();
        self.clock.advance(chrono::Duration::seconds(1));
        run
    }

    pub async fn run(&self, id: Uuid) -> Run {
        self.service.get_run(id).await.unwrap()
    }

    pub async fn tick(&self) {
        self.processor.process_once().await.unwrap();
    }

    pub fn handle_of(run: &Run) -> String {
        run.container_id.clone().expect("run has no container")
    }

    pub fn app(&self) -> axum::Router {
        self.app_with_auth(AuthPolicy::open())
    }

    pub fn app_with_auth(&self, auth: AuthPolicy) -> axum::Router {
        api::router(AppState {
            service: self.service.clone(),
            auth: Arc::new(auth),
            container_prefix: Arc::from(PREFIX),
            max_upload_bytes: self.config.server.max_upload_bytes,
        })
    }
}

pub fn file_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

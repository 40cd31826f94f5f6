//! Session bootstrap for `precheck-server serve`.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState, AuthPolicy};
use crate::artifacts::remove_dir_if_exists;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::Result;
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::scheduler::{orphan, QueueProcessor, UploadReaper};
use crate::service::PrecheckService;
use crate::store::StateStore;

/// One scheduling session: a fresh state store, the background loops and
/// the HTTP API.
pub struct Server {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    clock: Arc<dyn Clock>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let runtime = Arc::new(DockerCli::new(config.docker.clone()));
        Self::with_runtime(config, runtime)
    }

    pub fn with_runtime(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the session until `shutdown` is cancelled.
    ///
    /// Startup order:
    /// 1. Orphan guard: refuse to start while managed containers exist
    /// 2. Storage directories; uploads of a previous session are purged,
    ///    run directories are kept for inspection
    /// 3. Queue processor and upload reaper
    /// 4. HTTP listener (blocking until shutdown)
    ///
    /// # Errors
    ///
    /// [`crate::PrecheckError::Config`] for an invalid configuration;
    /// [`crate::PrecheckError::ConfigurationConflict`] when orphans exist;
    /// I/O errors for the storage tree or the listener.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;
        let server = &self.config.server;
        let addr = server.listen_addr()?;
        let auth = AuthPolicy::from_config(&self.config.auth)?;

        orphan::check(self.runtime.as_ref()).await?;
        prepare_storage(&server.uploads_dir(), &server.runs_dir()).await?;

        let store = StateStore::new(server.upload_ttl(), self.clock.clone()).shared();

        let processor = QueueProcessor::new(
            store.clone(),
            self.runtime.clone(),
            self.clock.clone(),
            server.max_concurrent,
        )
        .with_poll_interval(server.poll_interval())
        .with_stop_timeout(self.config.docker.stop_timeout());
        let processor_token = shutdown.clone();
        let processor_task = tokio::spawn(async move {
            processor.run(processor_token).await;
        });

        let reaper = UploadReaper::new(store.clone(), server.uploads_dir())
            .with_interval(server.cleanup_interval());
        let reaper_token = shutdown.clone();
        let reaper_task = tokio::spawn(async move {
            reaper.run(reaper_token).await;
        });

        let service = PrecheckService::new(
            &self.config,
            store,
            self.runtime.clone(),
            self.clock.clone(),
        );
        let state = AppState {
            service,
            auth: Arc::new(auth),
            container_prefix: Arc::from(self.config.docker.container_prefix.as_str()),
            max_upload_bytes: server.max_upload_bytes,
        };

        let served = serve(addr, state, shutdown.clone()).await;
        // a listener failure still has to stop the loops
        shutdown.cancel();
        let (processor_done, reaper_done) = tokio::join!(processor_task, reaper_task);
        for (task, done) in [
            ("queue processor", processor_done),
            ("upload reaper", reaper_done),
        ] {
            if let Err(e) = done {
                tracing::error!(task, error = %e, "Background task failed");
            }
        }
        tracing::info!("Session ended");
        served
    }
}

async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP listener");
        e
    })?;
    tracing::info!(addr = %addr, "Precheck API listening");

    let app = api::router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Create the storage tree. Upload rows do not survive a restart, so any
/// upload files on disk belong to nobody.
pub async fn prepare_storage(uploads_dir: &Path, runs_dir: &Path) -> Result<()> {
    remove_dir_if_exists(uploads_dir).await?;
    tokio::fs::create_dir_all(uploads_dir).await?;
    tokio::fs::create_dir_all(runs_dir).await?;
    tracing::debug!(uploads = %uploads_dir.display(), runs = %runs_dir.display(), "Storage ready");
    Ok(())
}

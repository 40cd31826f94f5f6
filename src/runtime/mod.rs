//! Container runtime client.
//!
//! The scheduler talks to containers only through [`ContainerRuntime`]. Every
//! lookup distinguishes three outcomes:
//!
//! - `Ok(Some(_))`: the container exists and the call succeeded
//! - `Ok(None)`: the container genuinely does not exist (it disappeared)
//! - `Err(_)`: the runtime call itself failed; the container may still exist
//!
//! Nothing here panics or aborts the caller; callers decide whether an error
//! is worth surfacing.
//!
//! [`DockerCli`] is the production implementation, driving the `docker`
//! binary with a bounded timeout per call.

pub mod docker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub use docker::DockerCli;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("unexpected output from `{command}`: {reason}")]
    Decode { command: String, reason: String },
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// A managed container as listed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    /// Runtime state string (`running`, `exited`, `created`, ...)
    pub state: String,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Live state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub running: bool,
    pub exited: bool,
    pub exit_code: i32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What to run for one precheck.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub run_id: Uuid,
    pub work_dir: PathBuf,
    pub top_cell: String,
    pub die_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Unix seconds
    pub since: Option<i64>,
    pub tail: Option<usize>,
    pub timestamps: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container carrying the configured name prefix, in any state.
    async fn list_managed(&self) -> RuntimeResult<Vec<ContainerRecord>>;

    async fn count_running(&self) -> RuntimeResult<usize> {
        Ok(self
            .list_managed()
            .await?
            .iter()
            .filter(|c| c.is_running())
            .count())
    }

    /// Start a detached precheck container and return its handle. The
    /// container's completion is observed later through [`Self::status`].
    async fn start(&self, spec: &LaunchSpec) -> RuntimeResult<String>;

    async fn status(&self, handle: &str) -> RuntimeResult<Option<ContainerStatus>>;

    async fn logs(&self, handle: &str, options: &LogOptions) -> RuntimeResult<Option<String>>;

    /// Opaque resource usage snapshot.
    async fn stats(&self, handle: &str) -> RuntimeResult<Option<serde_json::Value>>;

    /// Stop gracefully within `timeout`, then remove. `Ok(false)` when the
    /// handle no longer resolves.
    async fn stop_and_remove(&self, handle: &str, timeout: Duration) -> RuntimeResult<bool>;

    /// Stop and remove every managed container; returns the removed names.
    /// Containers that fail to stop are logged and skipped.
    async fn cleanup_all(&self, timeout: Duration) -> RuntimeResult<Vec<String>> {
        let mut removed = Vec::new();
        for container in self.list_managed().await? {
            match self.stop_and_remove(&container.id, timeout).await {
                Ok(true) => removed.push(container.name),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(container = %container.name, error = %e, "Failed to remove container");
                }
            }
        }
        Ok(removed)
    }
}

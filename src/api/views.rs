//! JSON bodies of the HTTP API. Entity views follow the Docker API's
//! PascalCase shape so existing docker tooling habits carry over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::Checksums;
use crate::store::{Run, RunStatus, Upload};

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadStateView {
    pub status: &'static str,
    pub expired: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadView {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
    pub size: u64,
    pub checksums: Checksums,
    pub expires_at: DateTime<Utc>,
    pub state: UploadStateView,
}

impl From<Upload> for UploadView {
    fn from(upload: Upload) -> Self {
        Self {
            id: upload.id,
            name: upload.name,
            created: upload.created_at,
            size: upload.size,
            checksums: upload.checksums,
            expires_at: upload.expires_at,
            state: UploadStateView {
                status: if upload.expired { "expired" } else { "available" },
                expired: upload.expired,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunStateView {
    pub status: RunStatus,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output_missing: bool,
}

#[derive(Debug, Serialize)]
pub struct RunLabelsView {
    pub upload_id: Uuid,
    pub top_cell: String,
    pub die_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunConfigView {
    pub labels: RunLabelsView,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueView {
    pub position: Option<usize>,
    pub length: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InputView {
    pub checksums: Checksums,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OutputView {
    pub available: bool,
    pub checksums: Option<Checksums>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunView {
    pub id: Uuid,
    pub name: String,
    pub created: DateTime<Utc>,
    pub state: RunStateView,
    pub config: RunConfigView,
    pub queue: QueueView,
    pub container_id: Option<String>,
    pub input: InputView,
    pub output: OutputView,
}

impl RunView {
    /// `container_prefix` names the run the way its container is named.
    pub fn new(run: Run, queue_length: usize, container_prefix: &str) -> Self {
        let output_missing = run.output_missing();
        Self {
            id: run.id,
            name: format!("{}{}", container_prefix, run.id),
            created: run.created_at,
            state: RunStateView {
                status: run.status,
                running: run.status == RunStatus::Running,
                started_at: run.started_at,
                finished_at: run.finished_at,
                exit_code: run.exit_code,
                error: run.error,
                output_missing,
            },
            config: RunConfigView {
                labels: RunLabelsView {
                    upload_id: run.upload_id,
                    top_cell: run.top_cell,
                    die_id: run.die_id,
                },
            },
            queue: QueueView {
                position: run.queue_position,
                length: queue_length,
            },
            container_id: run.container_id,
            input: InputView {
                checksums: run.input_checksums,
            },
            output: OutputView {
                available: run.output_checksums.is_some(),
                checksums: run.output_checksums,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitView {
    pub status: RunStatus,
    pub status_code: Option<i32>,
    pub error: Option<String>,
}

impl From<Run> for WaitView {
    fn from(run: Run) -> Self {
        Self {
            status: run.status,
            status_code: run.exit_code,
            error: run.error,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrphanView {
    pub id: String,
    pub name: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct CleanupView {
    pub removed: Vec<String>,
}

// Requests

#[derive(Debug, Deserialize)]
pub struct CreatePrecheckRequest {
    pub upload_id: Uuid,
    pub top_cell: String,
    pub die_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadParams {
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    /// Comma-separated statuses
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    pub since: Option<i64>,
    pub tail: Option<usize>,
    #[serde(default)]
    pub timestamps: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    /// Seconds
    pub timeout: Option<u64>,
}

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::Checksums;

pub const DEFAULT_DIE_ID: &str = "FFFFFFFF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Edges of the run state machine. `Queued -> Failed` is a launch failure:
    /// the run never reaches `Running`.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown run status: {s}"))
    }
}

/// An ingested layout file.
#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub checksums: Checksums,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Derived on every read from the store's clock; never stored.
    pub expired: bool,
}

impl Upload {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// One precheck run against an upload.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub top_cell: String,
    pub die_id: String,
    pub run_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub input_checksums: Checksums,
    pub output_checksums: Option<Checksums>,
    /// 1-indexed rank among queued runs, filled in on read.
    pub queue_position: Option<usize>,
}

impl Run {
    /// The process exited cleanly but left no output artifact behind.
    pub fn output_missing(&self) -> bool {
        self.status == RunStatus::Completed && self.output_checksums.is_none()
    }

    pub(crate) fn queue_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.created_at, self.id)
    }
}

/// Fields for a new run row. The id is chosen by the caller because the
/// working directory is keyed by it and must exist before the row does.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: Uuid,
    pub upload_id: Uuid,
    pub top_cell: String,
    pub die_id: String,
    pub run_dir: PathBuf,
}

/// Partial update of a run; only `Some` fields are applied.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub output_checksums: Option<Checksums>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_output_checksums(mut self, sums: Option<Checksums>) -> Self {
        self.output_checksums = sums;
        self
    }
}

use thiserror::Error;
use uuid::Uuid;

use crate::runtime::RuntimeError;
use crate::store::RunStatus;

#[derive(Error, Debug)]
pub enum PrecheckError {
    #[error("No such upload: {0}")]
    UploadNotFound(Uuid),

    #[error("No such precheck: {0}")]
    RunNotFound(Uuid),

    #[error("Upload has expired: {0}")]
    Expired(Uuid),

    #[error("Invalid transition for run {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Run {id} is still {status}; cancel it or force the delete")]
    RunActive { id: Uuid, status: RunStatus },

    #[error("Precheck is not running: {0}")]
    NotRunning(Uuid),

    #[error("Precheck not completed: {id} is {status}")]
    NotCompleted { id: Uuid, status: RunStatus },

    #[error("Output GDS not found for run {0}")]
    OutputMissing(Uuid),

    #[error("Timed out waiting for run {id}, last status {status}")]
    Timeout { id: Uuid, status: RunStatus },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Found {} orphaned containers: {}", .0.len(), .0.join(", "))]
    ConfigurationConflict(Vec<String>),

    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrecheckError {
    /// True for the variants that mean "the referenced entity does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PrecheckError::UploadNotFound(_) | PrecheckError::RunNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PrecheckError>;

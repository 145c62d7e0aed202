//! Error types for the trading decision pipeline

use thiserror::Error;

use crate::models::WorkerRole;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Worker {role} failed: {reason}")]
    WorkerFailure { role: WorkerRole, reason: String },

    #[error("Worker {role} timed out after {timeout_ms} ms")]
    WorkerTimeout { role: WorkerRole, timeout_ms: u64 },

    #[error("Required worker(s) produced no opinion: {0:?}")]
    RequiredInputMissing(Vec<WorkerRole>),

    #[error("Worker returned an invalid opinion: {0}")]
    InvalidOpinion(String),

    #[error("No worker registered for role {0}")]
    WorkerNotRegistered(WorkerRole),

    #[error("Run deadline exceeded in phase {phase}")]
    RunDeadlineExceeded { phase: String },

    #[error("History store failure: {0}")]
    PersistenceFailure(String),

    #[error("History record not found for run {0}")]
    RecordNotFound(uuid::Uuid),

    #[error("{field} already recorded for run {run_id}")]
    AlreadyRecorded {
        run_id: uuid::Uuid,
        field: &'static str,
    },

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl PipelineError {
    /// True for failures that are survivable inside a phase (recorded on the
    /// run, retried, or treated as an absent best-effort opinion) rather than
    /// fatal to the whole run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::WorkerFailure { .. }
                | PipelineError::WorkerTimeout { .. }
                | PipelineError::InvalidOpinion(_)
        )
    }
}

//! Error taxonomy for the supervisor/dispatch core.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("object store error: {0}")]
    Store(#[from] gangplank_store::StoreError),

    #[error("podder error: {0}")]
    Podder(#[from] gangplank_podder::PodderError),

    #[error(transparent)]
    Core(#[from] gangplank_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("readiness timeout waiting for stage {stage} after {waited:?}: required artifacts never appeared")]
    ReadinessTimeout {
        stage: String,
        waited: std::time::Duration,
    },

    #[error("stage {stage} failed: {detail}")]
    StageFailed { stage: String, detail: String },

    #[error("run was cancelled before completion")]
    Cancelled,

    /// The single error `Exec` synthesizes when any stage's task
    /// errored out of a wave.
    #[error("process failed")]
    ProcessFailed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

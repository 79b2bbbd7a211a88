//! Error taxonomy for the in-pod worker runtime.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object store error: {0}")]
    Store(#[from] gangplank_store::StoreError),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] gangplank_core::Error),

    #[error("destination already exists and refused overwrite: {0}")]
    RefusedOverwrite(std::path::PathBuf),

    #[error("unknown secret kind for secret {0:?}: {1:?}")]
    UnknownSecretKind(String, Option<String>),

    #[error("unknown registry secret type: {0}")]
    UnknownRegistrySecretType(String),

    #[error("stage {stage} {phase} failed: {detail}")]
    CommandFailed {
        stage: String,
        phase: &'static str,
        detail: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PodderError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("pod watch timed out after {0:?}")]
    WatchTimeout(std::time::Duration),

    #[error("worker pod exited with a non-zero code: {0:?}")]
    NonZeroExit(Option<i32>),

    #[error("worker pod disappeared before reporting completion")]
    Orphaned,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PodderError>;

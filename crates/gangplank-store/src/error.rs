use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object store is already running")]
    AlreadyStarted,

    #[error("no free TCP port found starting from {0}")]
    NoFreePort(u16),

    #[error("failed to spawn embedded store process: {0}")]
    Spawn(std::io::Error),

    #[error("object store process exited before becoming ready")]
    ProcessExitedEarly,

    #[error("a tunnel cannot be combined with an external store")]
    TunnelIncompatibleWithExternalStore,

    #[error("s3 request failed: {0}")]
    S3(String),

    #[error("object not found: {0}")]
    NotFound(String),

    #[error("ssh tunnel error: {0}")]
    Tunnel(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

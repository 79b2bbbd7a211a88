//! Error taxonomy for Gangplank.
//!
//! Mirrors the categories a run can fail in: configuration errors
//! are fatal at startup, transient dependency errors are expected and
//! retried by the readiness poll, everything else is a stage failure that
//! aborts the run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("required artifact not yet available: {0}")]
    TransientDependency(String),

    #[error("readiness timeout waiting for: {0}")]
    ReadinessTimeout(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("object store error: {0}")]
    Store(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("process failed")]
    ProcessFailed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

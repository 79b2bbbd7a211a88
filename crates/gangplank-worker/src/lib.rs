//! In-pod worker runtime for Gangplank.
//!
//! A worker boots by reading `COSA_WORK_POD_JSON`
//! ([`gangplank_core::workspec::WORK_POD_ENV_VAR`]), chdirs to `/srv`,
//! injects secrets, reconstructs its workspace from `RemoteFile`s, runs a
//! stage's prep/main/post scripts, and uploads returns.

pub mod error;
pub mod publish;
pub mod reader;
pub mod returns;
pub mod secrets;
pub mod stage_exec;
pub mod worker;
pub mod workspace;

pub use error::{Result, WorkerError};
pub use reader::{AssemblerReader, LocalFsAssemblerReader};
pub use worker::{Worker, WorkerConfig};

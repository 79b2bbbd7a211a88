//! Core domain types for the Gangplank build orchestrator.
//!
//! This crate contains:
//! - Resource identifiers (`StageId`, `RunId`, `BuildId`)
//! - The `JobSpec`/`Stage`/`Override` data model
//! - The `WorkSpec` wire envelope and `ReturnTarget`
//! - `RemoteFile`, the addressable artifact descriptor
//! - The closed `CloudTarget` publication variant
//! - The shared error taxonomy

pub mod cloud;
pub mod error;
pub mod id;
pub mod jobspec;
pub mod remote_file;
pub mod repo_file;
pub mod stage;
pub mod workspec;

pub use cloud::CloudTarget;
pub use error::{Error, Result};
pub use id::{BuildId, RunId, StageId};
pub use jobspec::{Build, BuildArtifact, BuildIdentity, JobSpec};
pub use remote_file::RemoteFile;
pub use repo_file::{RepoFile, RepoFileSource};
pub use stage::{Override, Stage};
pub use workspec::{ArtifactType, ReturnTarget, WorkSpec, WORK_POD_ENV_VAR};

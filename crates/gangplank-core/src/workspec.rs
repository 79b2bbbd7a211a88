//! The WorkSpec wire envelope: what the supervisor hands to a worker pod.

use serde::{Deserialize, Serialize};

use crate::id::StageId;
use crate::jobspec::{BuildIdentity, JobSpec};
use crate::remote_file::RemoteFile;

/// Name of the environment variable a worker pod reads its `WorkSpec` from
/// Its presence is how a process decides it is a worker rather than a supervisor.
pub const WORK_POD_ENV_VAR: &str = "COSA_WORK_POD_JSON";

/// Where a worker uploads stage returns, and whether it may overwrite
/// existing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnTarget {
    pub store_endpoint: String,
    /// Credentials the worker uses to reach `store_endpoint` itself, not
    /// just to upload returns to it — the same store also backs every
    /// `RemoteFile` fetch the worker performs. Generated fresh per run for
    /// an embedded store; copied from the external-store config otherwise.
    pub store_access_key: String,
    pub store_secret_key: String,
    pub bucket: String,
    pub key_prefix: String,
    pub overwrite: bool,
    /// Restricts which of the stage's declared returns (cache, cache_repo,
    /// files) this target actually accepts; empty means all of them.
    #[serde(default)]
    pub artifact_types: Vec<ArtifactType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Cache,
    CacheRepo,
    Files,
}

impl ReturnTarget {
    pub fn accepts(&self, kind: ArtifactType) -> bool {
        self.artifact_types.is_empty() || self.artifact_types.contains(&kind)
    }
}

/// The serialized envelope passed from supervisor to worker.
///
/// Transported as a JSON string in `COSA_WORK_POD_JSON`; callers must keep
/// large blobs and scripts out of this envelope (use `RemoteFile`s) since
/// host environment-variable size limits bound it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    pub job: JobSpec,
    pub execute_stages: Vec<StageId>,
    pub remote_files: Vec<RemoteFile>,
    pub r#return: ReturnTarget,
    pub api_build: Option<BuildIdentity>,
}

impl WorkSpec {
    pub fn to_env_value(&self) -> crate::error::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::error::Error::Internal(format!("worspec encode: {e}")))
    }

    pub fn from_env_value(raw: &str) -> crate::error::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::error::Error::Internal(format!("workspec decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn return_target_with_no_restriction_accepts_everything() {
        let rt = ReturnTarget {
            store_endpoint: "http://127.0.0.1:9000".to_string(),
            store_access_key: "test".to_string(),
            store_secret_key: "test".to_string(),
            bucket: "builder".to_string(),
            key_prefix: String::new(),
            overwrite: false,
            artifact_types: vec![],
        };
        assert!(rt.accepts(ArtifactType::Cache));
        assert!(rt.accepts(ArtifactType::Files));
    }

    #[test]
    fn return_target_restriction_is_honored() {
        let rt = ReturnTarget {
            store_endpoint: "http://127.0.0.1:9000".to_string(),
            store_access_key: "test".to_string(),
            store_secret_key: "test".to_string(),
            bucket: "builder".to_string(),
            key_prefix: String::new(),
            overwrite: false,
            artifact_types: vec![ArtifactType::Files],
        };
        assert!(rt.accepts(ArtifactType::Files));
        assert!(!rt.accepts(ArtifactType::Cache));
    }

    #[test]
    fn workspec_roundtrips_through_env_value() {
        let job = JobSpec {
            name: "demo".to_string(),
            stages: vec![],
            env: HashMap::new(),
            workspace_root: "/srv".into(),
            results_bucket: "builder".to_string(),
            overrides: vec![],
            copy_build: None,
            repo_files: vec![],
        };
        let spec = WorkSpec {
            job,
            execute_stages: vec![StageId::new("base")],
            remote_files: vec![],
            r#return: ReturnTarget {
                store_endpoint: "http://127.0.0.1:9000".to_string(),
                store_access_key: "test".to_string(),
                store_secret_key: "test".to_string(),
                bucket: "builder".to_string(),
                key_prefix: String::new(),
                overwrite: false,
                artifact_types: vec![],
            },
            api_build: None,
        };

        let encoded = spec.to_env_value().unwrap();
        let decoded = WorkSpec::from_env_value(&encoded).unwrap();
        assert_eq!(decoded.execute_stages, spec.execute_stages);
    }
}

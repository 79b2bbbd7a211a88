//! The JobSpec: a resolved, normalized stage list plus run-wide settings.
//!
//! Parsing a JobSpec from its YAML source is out of scope for Gangplank —
//! callers hand in an already-normalized `JobSpec`. This module only owns
//! the in-memory shape and the deep-copy used to hand a stage to its own
//! task without aliasing the supervisor's copy.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{BuildId, StageId};
use crate::repo_file::RepoFile;
use crate::stage::{Override, Stage};

/// A normalized description of one run: its stages plus run-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub stages: Vec<Stage>,
    /// Global environment merged under each stage's own `env`.
    pub env: HashMap<String, String>,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_results_bucket")]
    pub results_bucket: String,
    /// Job-level override inputs; a stage's own `overrides` are additional
    /// to these, not a replacement.
    #[serde(default)]
    pub overrides: Vec<Override>,
    /// If set, a prior build to copy artifacts from before dispatch.
    #[serde(default)]
    pub copy_build: Option<BuildId>,
    /// Repo files materialized into `src/config/<name>.repo` before any
    /// stage command runs.
    #[serde(default)]
    pub repo_files: Vec<RepoFile>,
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/srv")
}

fn default_results_bucket() -> String {
    "builder".to_string()
}

impl JobSpec {
    /// Deep-copy via JSON round-trip. This is the only way a stage may
    /// cross a task boundary — sharing `&Stage`/`Arc<Stage>` into a spawned
    /// task risks a concurrently-running stage observing another stage's
    /// in-progress mutations to the same in-memory tree.
    pub fn deep_copy(&self) -> Result<JobSpec> {
        let encoded = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("jobspec encode: {e}")))?;
        serde_json::from_slice(&encoded)
            .map_err(|e| Error::Internal(format!("jobspec decode: {e}")))
    }

    pub fn stage(&self, id: &StageId) -> Option<&Stage> {
        self.stages.iter().find(|s| &s.id == id)
    }

    /// Validate every stage's invariants.
    pub fn validate(&self) -> Result<()> {
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }
}

/// Build-identity envelope, equivalent to a Kubernetes Build object, used
/// for annotation-based pod naming. Synthesized when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildIdentity {
    pub build_config_name: String,
    pub build_number: u64,
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl BuildIdentity {
    /// Synthesize an identity when the caller supplies none.
    pub fn synthesize() -> Self {
        let uuid = uuid::Uuid::now_v7();
        Self {
            build_config_name: format!("gangplank-{uuid}"),
            build_number: 0,
            namespace: "default".to_string(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
        }
    }

    /// `<buildconfig-name>-<build-number>-worker-<stage-index>`.
    pub fn pod_name(&self, stage_index: usize) -> String {
        format!(
            "{}-{}-worker-{}",
            self.build_config_name, self.build_number, stage_index
        )
    }
}

/// Opaque per-artifact record from a prior image build, read through an
/// external assembler library. Gangplank treats the assembler's own build
/// metadata format as a black box beyond these three fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Metadata record for a prior image build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub build_id: BuildId,
    pub artifacts: HashMap<String, BuildArtifact>,
}

impl Build {
    /// Parse the artifact catalog out of a build's `meta.json`, whose
    /// `images` map (`{"images": {"qemu": {"path": ..., "sha256": ...,
    /// "size": ...}}}`) is the assembler's own published record of what it
    /// produced. Gangplank treats everything else in the document as
    /// opaque — the assembler binary and its output format are its own
    /// collaborator's concern — and only reads this one field.
    pub fn from_meta_json(build_id: BuildId, meta: &serde_json::Value) -> Self {
        let mut artifacts = HashMap::new();
        if let Some(images) = meta.get("images").and_then(|v| v.as_object()) {
            for (name, entry) in images {
                let path = entry.get("path").and_then(|v| v.as_str()).unwrap_or_default();
                let sha256 = entry.get("sha256").and_then(|v| v.as_str()).unwrap_or_default();
                let size = entry.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
                artifacts.insert(
                    name.clone(),
                    BuildArtifact {
                        path: path.to_string(),
                        sha256: sha256.to_string(),
                        size,
                    },
                );
            }
        }
        Self { build_id, artifacts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobSpec {
        JobSpec {
            name: "test".to_string(),
            stages: vec![],
            env: HashMap::new(),
            workspace_root: default_workspace_root(),
            results_bucket: default_results_bucket(),
            overrides: vec![],
            copy_build: None,
            repo_files: vec![],
        }
    }

    #[test]
    fn deep_copy_is_independent() {
        let mut original = job();
        original.stages.push(Stage {
            id: StageId::new("base"),
            execution_order: 1,
            concurrent_execution: false,
            build_artifacts: vec!["base".to_string()],
            require_artifacts: vec![],
            request_artifacts: vec![],
            require_cache: false,
            request_cache: false,
            require_cache_repo: false,
            request_cache_repo: false,
            return_cache: false,
            return_cache_repo: false,
            return_files: vec![],
            prep_commands: vec![],
            commands: vec![],
            post_commands: vec![],
            post_always: false,
            overrides: vec![],
            env: HashMap::new(),
        });

        let mut copy = original.deep_copy().unwrap();
        copy.stages[0].execution_order = 99;

        assert_eq!(original.stages[0].execution_order, 1);
        assert_eq!(copy.stages[0].execution_order, 99);
    }

    #[test]
    fn synthesized_identity_has_a_pod_name() {
        let ident = BuildIdentity::synthesize();
        assert!(ident.pod_name(0).ends_with("-worker-0"));
    }

    #[test]
    fn build_parses_images_map_from_meta_json() {
        let meta = serde_json::json!({
            "buildid": "39.20240101.0.0",
            "images": {
                "qemu": {"path": "fedora-coreos.qcow2", "sha256": "abc123", "size": 1024},
            },
        });
        let build = Build::from_meta_json(BuildId::new("39.20240101.0.0"), &meta);
        let qemu = build.artifacts.get("qemu").unwrap();
        assert_eq!(qemu.path, "fedora-coreos.qcow2");
        assert_eq!(qemu.size, 1024);
    }

    #[test]
    fn build_from_meta_json_without_images_is_empty() {
        let build = Build::from_meta_json(BuildId::new("x"), &serde_json::json!({}));
        assert!(build.artifacts.is_empty());
    }
}

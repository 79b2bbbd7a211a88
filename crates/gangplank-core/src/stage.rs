//! Stage definitions — the unit of work a JobSpec decomposes into.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::StageId;

/// The `base` short-hand expands to these two artifacts.
const BASE_ARTIFACTS: [&str; 2] = ["ostree", "qemu"];

/// An RPM/tarball input fetched and packed into a per-stage override
/// tarball before the stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Override {
    /// Bucket/object coordinates of the RPM or tarball to fetch.
    pub bucket: String,
    pub object: String,
    /// Path inside the override tarball this input should be packed at.
    pub pack_path: String,
}

/// A single stage in a JobSpec's execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: StageId,

    /// Stages with equal order may run in parallel; groups run in
    /// ascending order. A default of 0 is promoted to 2 at plan formation
    /// time, keeping explicit `1` reserved for pre-base stages.
    pub execution_order: i64,

    /// Whether this stage's `commands` run concurrently with each other.
    pub concurrent_execution: bool,

    pub build_artifacts: Vec<String>,
    pub require_artifacts: Vec<String>,
    pub request_artifacts: Vec<String>,

    pub require_cache: bool,
    pub request_cache: bool,
    pub require_cache_repo: bool,
    pub request_cache_repo: bool,

    pub return_cache: bool,
    pub return_cache_repo: bool,
    pub return_files: Vec<String>,

    pub prep_commands: Vec<String>,
    pub commands: Vec<String>,
    pub post_commands: Vec<String>,
    /// Run `post_commands` even when `commands` fails.
    pub post_always: bool,

    pub overrides: Vec<Override>,

    /// Stage-specific environment variables, merged over the JobSpec's
    /// global environment.
    pub env: HashMap<String, String>,
}

impl Stage {
    /// Expand `base` in `build_artifacts` to `{ostree, qemu}` and return the
    /// flattened set the stage actually produces.
    pub fn expanded_build_artifacts(&self) -> Vec<String> {
        let mut out = Vec::new();
        for a in &self.build_artifacts {
            if a == "base" {
                for b in BASE_ARTIFACTS {
                    if !out.iter().any(|x: &String| x == b) {
                        out.push(b.to_string());
                    }
                }
            } else if !out.iter().any(|x: &String| x == a) {
                out.push(a.clone());
            }
        }
        out
    }

    /// Validate this stage's declared dependencies:
    ///
    /// - `require_artifacts` must not overlap `build_artifacts` (after
    ///   `base` expansion and dedup).
    /// - A stage that returns a cache must not also require that same
    ///   cache (self-dependency deadlock).
    pub fn validate(&self) -> Result<()> {
        let built = self.expanded_build_artifacts();
        for req in &self.require_artifacts {
            if built.iter().any(|b| b == req) {
                return Err(Error::Config(format!(
                    "stage {}: require_artifacts contains {req:?}, which it also builds",
                    self.id
                )));
            }
        }

        if self.return_cache && self.require_cache {
            return Err(Error::Config(format!(
                "stage {}: cannot both require and return the cache (self-dependency)",
                self.id
            )));
        }
        if self.return_cache_repo && self.require_cache_repo {
            return Err(Error::Config(format!(
                "stage {}: cannot both require and return the cache repo (self-dependency)",
                self.id
            )));
        }

        Ok(())
    }

    /// Hard dependencies that must already be resolvable before this stage
    /// may be dispatched against the readiness predicate.
    pub fn hard_dependencies(&self) -> Vec<String> {
        let mut deps = self.require_artifacts.clone();
        if self.require_cache {
            deps.push("cache/cache.tar.gz".to_string());
        }
        if self.require_cache_repo {
            deps.push("cache/repo.tar.gz".to_string());
        }
        deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(build: &[&str], require: &[&str]) -> Stage {
        Stage {
            id: StageId::new("s"),
            execution_order: 2,
            concurrent_execution: false,
            build_artifacts: build.iter().map(|s| s.to_string()).collect(),
            require_artifacts: require.iter().map(|s| s.to_string()).collect(),
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
        }
    }

    #[test]
    fn base_expands_to_ostree_and_qemu() {
        let s = stage(&["base"], &[]);
        let mut expanded = s.expanded_build_artifacts();
        expanded.sort();
        assert_eq!(expanded, vec!["ostree".to_string(), "qemu".to_string()]);
    }

    #[test]
    fn require_overlapping_build_is_rejected() {
        let s = stage(&["base"], &["qemu"]);
        assert!(s.validate().is_err());
    }

    #[test]
    fn disjoint_require_and_build_is_fine() {
        let s = stage(&["metal"], &["ostree"]);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn return_and_require_same_cache_is_rejected() {
        let mut s = stage(&[], &[]);
        s.return_cache = true;
        s.require_cache = true;
        assert!(s.validate().is_err());
    }
}

//! Per-stage readiness: polls the store for a stage's hard dependencies,
//! opportunistically attaches its soft dependencies, and pins dependency
//! resolution to the first `BuildID` it observes for the remainder of the
//! run.

use std::sync::Arc;
use std::time::Duration;

use gangplank_core::{Build, BuildId, RemoteFile, Stage};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisorError};

const CACHE_KEY: &str = "cache/cache.tar.gz";
const CACHE_REPO_KEY: &str = "cache/repo.tar.gz";

/// Shared across every stage's readiness loop in a run so that once any
/// one of them observes a `BuildID` in `builds.json`, all the others stop
/// re-discovering it and resolve against the same pinned id.
#[derive(Clone, Default)]
pub struct BuildPin(Arc<RwLock<Option<BuildId>>>);

impl BuildPin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the current `Build` record: the pinned build if one has
    /// already been observed, otherwise the latest entry in `builds.json`,
    /// pinning it on first discovery.
    async fn resolve(
        &self,
        store: &gangplank_store::ObjectStore,
        results_bucket: &str,
    ) -> Option<Build> {
        if let Some(id) = self.0.read().await.clone() {
            return fetch_build(store, results_bucket, &id).await;
        }

        let build = discover_latest_build(store, results_bucket).await?;
        let mut pinned = self.0.write().await;
        if pinned.is_none() {
            info!(build_id = %build.build_id, "pinning dependency resolution to newly discovered build");
            *pinned = Some(build.build_id.clone());
        }
        Some(build)
    }
}

async fn discover_latest_build(
    store: &gangplank_store::ObjectStore,
    results_bucket: &str,
) -> Option<Build> {
    let raw = store.get_bytes(results_bucket, "builds.json").await.ok()?;
    let index: Value = serde_json::from_slice(&raw).ok()?;
    let build_id = index
        .get("builds")?
        .as_array()?
        .last()?
        .get("id")?
        .as_str()?
        .to_string();
    fetch_build(store, results_bucket, &BuildId::new(build_id)).await
}

async fn fetch_build(
    store: &gangplank_store::ObjectStore,
    results_bucket: &str,
    build_id: &BuildId,
) -> Option<Build> {
    let key = format!("{build_id}/meta.json");
    let raw = store.get_bytes(results_bucket, &key).await.ok()?;
    let meta: Value = serde_json::from_slice(&raw).ok()?;
    Some(Build::from_meta_json(build_id.clone(), &meta))
}

/// What a successful readiness check hands back to the dispatcher: the
/// `RemoteFile`s the worker should fetch (hard dependencies that are now
/// confirmed present, plus any soft dependency that happened to be).
pub struct ReadinessResult {
    pub remote_files: Vec<RemoteFile>,
}

async fn artifact_remote_file(
    build: &Build,
    results_bucket: &str,
    name: &str,
) -> Option<RemoteFile> {
    let artifact = build.artifacts.get(name)?;
    let key = format!("{}/{}", build.build_id, artifact.path);
    Some(RemoteFile::new(results_bucket, key))
}

/// Poll until every one of `stage`'s hard dependencies (`require_artifacts`
/// plus `require_cache`/`require_cache_repo`) is present in the store,
/// selecting against `terminate` each cycle so a broadcast close is
/// observed within at most one poll interval. Soft dependencies
/// (`request_*`) are attached opportunistically whenever present on the
/// same pass that satisfies readiness.
pub async fn wait_ready(
    store: &gangplank_store::ObjectStore,
    stage: &Stage,
    results_bucket: &str,
    pin: &BuildPin,
    poll_interval: Duration,
    timeout: Duration,
    terminate: &mut broadcast::Receiver<()>,
) -> Result<ReadinessResult> {
    let deadline = Instant::now() + timeout;

    loop {
        let build = pin.resolve(store, results_bucket).await;

        if let Some(result) = try_satisfy(store, stage, results_bucket, build.as_ref()).await {
            return Ok(result);
        }

        if Instant::now() >= deadline {
            return Err(SupervisorError::ReadinessTimeout {
                stage: stage.id.to_string(),
                waited: timeout,
            });
        }

        tokio::select! {
            _ = terminate.recv() => {
                debug!(stage = %stage.id, "readiness loop observed terminate broadcast");
                return Err(SupervisorError::Cancelled);
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// One readiness check: `None` if a hard dependency is still missing,
/// `Some` with the resolved `RemoteFile` set otherwise.
async fn try_satisfy(
    store: &gangplank_store::ObjectStore,
    stage: &Stage,
    results_bucket: &str,
    build: Option<&Build>,
) -> Option<ReadinessResult> {
    let mut remote_files = Vec::new();

    for name in &stage.require_artifacts {
        let Some(build) = build else { return None };
        let Some(rf) = artifact_remote_file(build, results_bucket, name).await else {
            return None;
        };
        if !store.exists(results_bucket, &rf.object).await {
            return None;
        }
        remote_files.push(rf);
    }

    if stage.require_cache {
        if !store.exists(results_bucket, CACHE_KEY).await {
            return None;
        }
        remote_files.push(RemoteFile::new(results_bucket, CACHE_KEY).compressed());
    }
    if stage.require_cache_repo {
        if !store.exists(results_bucket, CACHE_REPO_KEY).await {
            return None;
        }
        remote_files.push(RemoteFile::new(results_bucket, CACHE_REPO_KEY).compressed());
    }

    for name in &stage.request_artifacts {
        if let Some(build) = build {
            if let Some(rf) = artifact_remote_file(build, results_bucket, name).await {
                if store.exists(results_bucket, &rf.object).await {
                    remote_files.push(rf);
                    continue;
                }
            }
        }
        debug!(stage = %stage.id, artifact = %name, "requested artifact not yet present, omitting");
    }

    if stage.request_cache && store.exists(results_bucket, CACHE_KEY).await {
        remote_files.push(RemoteFile::new(results_bucket, CACHE_KEY).compressed());
    }
    if stage.request_cache_repo && store.exists(results_bucket, CACHE_REPO_KEY).await {
        remote_files.push(RemoteFile::new(results_bucket, CACHE_REPO_KEY).compressed());
    }

    Some(ReadinessResult { remote_files })
}

/// Log a structured warning once a stage's readiness times out, naming the
/// artifacts that never appeared.
pub fn log_readiness_timeout(stage: &Stage, waited: Duration) {
    warn!(
        stage = %stage.id,
        deps = ?stage.require_artifacts,
        waited_secs = waited.as_secs(),
        "required artifacts never appeared"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangplank_core::StageId;
    use std::collections::HashMap;

    fn empty_stage() -> Stage {
        Stage {
            id: StageId::new("s"),
            execution_order: 2,
            concurrent_execution: false,
            build_artifacts: vec![],
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
        }
    }

    #[test]
    fn stage_with_no_hard_deps_has_empty_hard_dependency_list() {
        let stage = empty_stage();
        assert!(stage.hard_dependencies().is_empty());
    }
}

//! Store seeding: before any stage is dispatched, the supervisor populates
//! the store with the inputs every worker needs to reconstruct a workspace
//! from nothing but `RemoteFile`s.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use gangplank_core::{BuildId, JobSpec, Stage, StageId};
use gangplank_store::ObjectStore;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{Result, SupervisorError};

const SOURCE_OBJECT: &str = "source.bin";

/// Decompress a local source archive into the workspace, then re-pack the
/// resulting tree as a gzip tarball and upload it as `source.bin` so a
/// remote worker's `RemoteFile::Extract` can reconstruct the same tree.
pub async fn seed_source_archive(
    store: &ObjectStore,
    results_bucket: &str,
    workspace_root: &Path,
    source_archive: &Path,
) -> Result<()> {
    let workspace_root = workspace_root.to_path_buf();
    let source_archive = source_archive.to_path_buf();
    let workspace_root_for_pack = workspace_root.clone();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&source_archive)
            .map_err(|e| SupervisorError::Internal(format!("open source archive: {e}")))?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive
            .unpack(&workspace_root)
            .map_err(|e| SupervisorError::Internal(format!("unpack source archive: {e}")))?;
        Ok(())
    })
    .await
    .map_err(|e| SupervisorError::Internal(format!("join error: {e}")))??;

    let body = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        {
            let mut builder = tar::Builder::new(&mut encoder);
            builder
                .append_dir_all(".", &workspace_root_for_pack)
                .map_err(|e| SupervisorError::Internal(format!("repack source tree: {e}")))?;
            builder
                .finish()
                .map_err(|e| SupervisorError::Internal(format!("finish tar: {e}")))?;
        }
        encoder
            .finish()
            .map_err(|e| SupervisorError::Internal(format!("finish gzip: {e}")))
    })
    .await
    .map_err(|e| SupervisorError::Internal(format!("join error: {e}")))??;

    store.put_bytes(results_bucket, SOURCE_OBJECT, body).await?;
    info!(object = SOURCE_OBJECT, "seeded source archive");
    Ok(())
}

/// Re-upload the most recent prior build's `meta.json`/`builds.json` (read
/// from a local directory left over from a previous run) so readiness
/// polling has an immediate `builds.json` to discover.
pub async fn seed_prior_build_metadata(
    store: &ObjectStore,
    results_bucket: &str,
    prior_build_dir: &Path,
) -> Result<()> {
    for (filename, warn_on_missing) in [("builds.json", false), ("meta.json", false)] {
        let path = prior_build_dir.join(filename);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                store.put_bytes(results_bucket, filename, bytes).await?;
                info!(filename, "seeded prior-build metadata");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !warn_on_missing => {}
            Err(e) => warn!(filename, error = %e, "failed to read prior-build metadata"),
        }
    }
    Ok(())
}

/// Copy a `CopyBuild` referenced by the JobSpec from a source store (an
/// external or prior run's store) into this run's store, so stages that
/// `RequireArtifacts` against it see those artifacts without the original
/// build having to be re-run.
pub async fn seed_copy_build(
    store: &ObjectStore,
    results_bucket: &str,
    copy_source: &ObjectStore,
    copy_build: &BuildId,
) -> Result<()> {
    let meta_key = format!("{copy_build}/meta.json");
    let meta_bytes = copy_source.get_bytes(results_bucket, &meta_key).await?;
    let meta: serde_json::Value = serde_json::from_slice(&meta_bytes)
        .map_err(|e| SupervisorError::Internal(format!("parse copy-build meta.json: {e}")))?;
    let build = gangplank_core::Build::from_meta_json(copy_build.clone(), &meta);

    store.put_bytes(results_bucket, &meta_key, meta_bytes).await?;

    for artifact in build.artifacts.values() {
        let key = format!("{copy_build}/{}", artifact.path);
        let bytes = copy_source.get_bytes(results_bucket, &key).await?;
        store.put_bytes(results_bucket, &key, bytes).await?;
    }

    info!(build_id = %copy_build, artifact_count = build.artifacts.len(), "copied referenced build into store");
    Ok(())
}

/// Discover `*.cosa.sh` scripts at the workspace root and package them as
/// an implicit pre-base stage, so ad-hoc assembler hooks run without the
/// JobSpec author having to declare a stage for them explicitly.
pub fn discover_implicit_cosa_stage(workspace_root: &Path) -> Option<Stage> {
    let mut scripts: Vec<PathBuf> = WalkDir::new(workspace_root)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".cosa.sh"))
        })
        .collect();

    if scripts.is_empty() {
        return None;
    }
    scripts.sort();

    let commands = scripts
        .iter()
        .map(|p| format!("bash {}", p.display()))
        .collect();

    Some(Stage {
        id: StageId::new("cosa-scripts"),
        execution_order: 1,
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
        commands,
        post_commands: vec![],
        post_always: false,
        overrides: vec![],
        env: Default::default(),
    })
}

/// Fold an implicit `cosa-scripts` stage (if any scripts are discovered)
/// into a `JobSpec`'s stage list. A no-op when the JobSpec already declares
/// a stage with that id.
pub fn with_implicit_cosa_stage(mut job: JobSpec, workspace_root: &Path) -> JobSpec {
    if job.stage(&StageId::new("cosa-scripts")).is_some() {
        return job;
    }
    if let Some(stage) = discover_implicit_cosa_stage(workspace_root) {
        job.stages.push(stage);
    }
    job
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_scripts_yields_no_implicit_stage() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(discover_implicit_cosa_stage(tmp.path()).is_none());
    }

    #[test]
    fn discovered_scripts_become_sorted_commands() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.cosa.sh"), "#!/bin/bash\n").unwrap();
        std::fs::write(tmp.path().join("a.cosa.sh"), "#!/bin/bash\n").unwrap();

        let stage = discover_implicit_cosa_stage(tmp.path()).unwrap();
        assert_eq!(stage.id.as_str(), "cosa-scripts");
        assert_eq!(stage.execution_order, 1);
        assert!(stage.commands[0].contains("a.cosa.sh"));
        assert!(stage.commands[1].contains("b.cosa.sh"));
    }
}

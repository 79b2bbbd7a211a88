//! Stage return packaging: `/srv/cache` and `/srv/tmp/repo` tarballs, plus
//! individually-named `ReturnFiles`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use flate2::write::GzEncoder;
use flate2::Compression;
use gangplank_core::{ArtifactType, ReturnTarget, Stage};
use gangplank_store::{is_metadata_object, ObjectStore};
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::{Result, WorkerError};

const CACHE_DIR: &str = "cache";
const CACHE_REPO_DIR: &str = "tmp/repo";

/// Upload a stage's declared returns after it succeeds: `ReturnCache` and
/// `ReturnCacheRepo` as gzipped tarballs, `ReturnFiles` individually.
pub async fn upload_returns(
    store: &ObjectStore,
    workspace_root: &Path,
    stage: &Stage,
    target: &ReturnTarget,
) -> Result<()> {
    if stage.return_cache && target.accepts(ArtifactType::Cache) {
        pack_and_upload(
            store,
            &workspace_root.join(CACHE_DIR),
            target,
            "cache/cache.tar.gz",
        )
        .await?;
    }

    if stage.return_cache_repo && target.accepts(ArtifactType::CacheRepo) {
        pack_and_upload(
            store,
            &workspace_root.join(CACHE_REPO_DIR),
            target,
            "cache/repo.tar.gz",
        )
        .await?;
    }

    if !stage.return_files.is_empty() && target.accepts(ArtifactType::Files) {
        for relative in &stage.return_files {
            let path = workspace_root.join(relative);
            let key = format!("{}{}", target.key_prefix, relative);

            // Overwrite policy: non-metadata artifacts are write-once — a
            // second producer of the same key is a programming error, not
            // something to silently clobber. Metadata is always eligible,
            // but only uploaded when the local copy is strictly newer than
            // the remote stamp, and on any comparison error we choose not
            // to overwrite.
            if store.exists(&target.bucket, &key).await {
                if !is_metadata_object(&key) {
                    info!(key, "non-metadata artifact already present, refusing to overwrite");
                    continue;
                }
                match store.is_local_newer(&target.bucket, &key, &path).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(key, "remote metadata is not older than local copy, skipping upload");
                        continue;
                    }
                    Err(e) => {
                        warn!(key, error = %e, "freshness comparison failed, refusing to overwrite");
                        continue;
                    }
                }
            }

            store.put(&target.bucket, &key, &path).await?;
            info!(path = %path.display(), key, "uploaded return file");
        }
    }

    Ok(())
}

/// Pack `source_dir` into a gzipped tarball and upload it as `key`. Some
/// files under `source_dir` may be root-owned (the assembler runs parts of
/// the pipeline as root), so packaging first tries `sudo tar`, falling back
/// to an unprivileged `tar` if sudo isn't available.
async fn pack_and_upload(
    store: &ObjectStore,
    source_dir: &Path,
    target: &ReturnTarget,
    key_suffix: &str,
) -> Result<()> {
    if tokio::fs::metadata(source_dir).await.is_err() {
        warn!(dir = %source_dir.display(), "return source directory missing, skipping");
        return Ok(());
    }

    let tarball_path = std::env::temp_dir().join(format!(
        "{}.tar.gz",
        key_suffix.replace('/', "-")
    ));

    pack_directory(source_dir, &tarball_path).await?;

    let key = format!("{}{}", target.key_prefix, key_suffix);
    store.put(&target.bucket, &key, &tarball_path).await?;
    let _ = tokio::fs::remove_file(&tarball_path).await;
    info!(dir = %source_dir.display(), key, "uploaded packed return");
    Ok(())
}

async fn pack_directory(source_dir: &Path, tarball_path: &Path) -> Result<()> {
    if try_sudo_tar(source_dir, tarball_path).await? {
        return Ok(());
    }

    let source_dir = source_dir.to_path_buf();
    let tarball_path = tarball_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&tarball_path)?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &source_dir)?;
        builder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("pack join error: {e}")))??;

    Ok(())
}

/// Try `sudo tar czf <tarball> -C <dir> .`; returns `Ok(true)` if it ran and
/// succeeded, `Ok(false)` if sudo is unavailable (caller falls back to the
/// unprivileged in-process packer), `Err` if sudo ran but tar itself failed.
async fn try_sudo_tar(source_dir: &Path, tarball_path: &Path) -> Result<bool> {
    let sudo_present = which_sudo().await;
    if !sudo_present {
        return Ok(false);
    }

    let status = Command::new("sudo")
        .args(["tar", "czf"])
        .arg(tarball_path)
        .arg("-C")
        .arg(source_dir)
        .arg(".")
        .stdin(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(true)
    } else {
        Err(WorkerError::Internal(format!(
            "sudo tar failed packing {}: {status:?}",
            source_dir.display()
        )))
    }
}

async fn which_sudo() -> bool {
    Command::new("sudo")
        .arg("-n")
        .arg("true")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Pack a stage's `overrides` into `cache/overrides-<random10>.tar.gz` and
/// return the key it was uploaded under, so the stage's commands can
/// reference it. Random suffix permits multiple concurrent overrides.
pub async fn pack_overrides(
    store: &ObjectStore,
    workspace_root: &Path,
    stage: &Stage,
    target: &ReturnTarget,
) -> Result<Option<String>> {
    if stage.overrides.is_empty() {
        return Ok(None);
    }

    let overrides_dir = workspace_root.join("overrides");
    tokio::fs::create_dir_all(&overrides_dir).await?;

    for ov in &stage.overrides {
        let dest = overrides_dir.join(&ov.pack_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        store.fetch(&ov.bucket, &ov.object, &dest).await?;
    }

    let suffix = random_suffix(10);
    let key_suffix = format!("cache/overrides-{suffix}.tar.gz");
    let tarball_path: PathBuf = std::env::temp_dir().join(format!("overrides-{suffix}.tar.gz"));
    pack_directory(&overrides_dir, &tarball_path).await?;

    let key = format!("{}{}", target.key_prefix, key_suffix);
    store.put(&target.bucket, &key, &tarball_path).await?;
    let _ = tokio::fs::remove_file(&tarball_path).await;

    Ok(Some(key))
}

fn random_suffix(len: usize) -> String {
    uuid::Uuid::now_v7().simple().to_string()[..len].to_string()
}

#[cfg(test)]
mod tests {
    use super::random_suffix;

    #[test]
    fn random_suffix_has_requested_length() {
        assert_eq!(random_suffix(10).len(), 10);
    }
}

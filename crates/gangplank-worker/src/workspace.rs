//! Workspace reconstruction: fetching/extracting `RemoteFile`s, materializing
//! repo files, and the `builds/latest` symlink invariant.

use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use gangplank_core::{RemoteFile, RepoFile, RepoFileSource};
use gangplank_store::ObjectStore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{Result, WorkerError};

/// chdir the process to `workspace_root`. Most of the assembler's tooling
/// assumes this absolute path, so this must happen before any other work.
pub fn enter_workspace(workspace_root: &Path) -> Result<()> {
    std::fs::create_dir_all(workspace_root)?;
    std::env::set_current_dir(workspace_root)?;
    Ok(())
}

/// Fetch or extract every `RemoteFile` in the WorkSpec. Destinations refuse
/// to silently overwrite: an existing path is removed first, then the final
/// write uses `O_EXCL` so a second racing writer observes an error rather
/// than silent corruption.
pub async fn reconstruct(
    store: &ObjectStore,
    workspace_root: &Path,
    remote_files: &[RemoteFile],
) -> Result<()> {
    for rf in remote_files {
        if rf.compressed {
            extract_one(store, workspace_root, rf).await?;
        } else {
            fetch_one(store, workspace_root, rf).await?;
        }
    }
    Ok(())
}

async fn fetch_one(store: &ObjectStore, workspace_root: &Path, rf: &RemoteFile) -> Result<()> {
    let dest = rf.fetch_path(workspace_root);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    reserve_destination(&dest).await?;
    store.fetch(&rf.bucket, &rf.object, &dest).await?;
    info!(bucket = %rf.bucket, object = %rf.object, dest = %dest.display(), "fetched remote file");
    Ok(())
}

async fn extract_one(store: &ObjectStore, workspace_root: &Path, rf: &RemoteFile) -> Result<()> {
    let extract_dir = rf.extract_path(workspace_root);
    tokio::fs::create_dir_all(&extract_dir).await?;

    let download_dest = std::env::temp_dir().join(format!("{}-{}.tar.gz", rf.bucket, rf.object.replace('/', "_")));
    store.fetch(&rf.bucket, &rf.object, &download_dest).await?;

    let extract_dir = extract_dir.clone();
    let download_dest_for_blocking = download_dest.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&download_dest_for_blocking)?;
        let decoder = GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&extract_dir)?;
        Ok(())
    })
    .await
    .map_err(|e| WorkerError::Internal(format!("extract join error: {e}")))??;

    let _ = tokio::fs::remove_file(&download_dest).await;
    info!(bucket = %rf.bucket, object = %rf.object, dest = %extract_dir.display(), "extracted remote archive");
    Ok(())
}

/// Remove an existing destination so the caller's subsequent create can use
/// `O_EXCL` semantics without racing against a stale prior write.
async fn reserve_destination(dest: &Path) -> Result<()> {
    if tokio::fs::metadata(dest).await.is_ok() {
        tokio::fs::remove_file(dest).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
    }
    use std::os::unix::fs::OpenOptionsExt;
    let opened = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(dest);
    match opened {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(WorkerError::RefusedOverwrite(dest.to_path_buf()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Materialize a stage's repo files into `src/config/<name>.repo`.
pub async fn materialize_repo_files(
    http: &reqwest::Client,
    workspace_root: &Path,
    repo_files: &[RepoFile],
) -> Result<()> {
    let config_dir = workspace_root.join("src/config");
    tokio::fs::create_dir_all(&config_dir).await?;

    for repo in repo_files {
        let body = match &repo.source {
            RepoFileSource::Inline(body) => body.clone(),
            RepoFileSource::Remote(url) => http.get(url).send().await?.text().await?,
        };

        let name = repo.name.clone().unwrap_or_else(|| {
            let mut hasher = Sha256::new();
            hasher.update(body.as_bytes());
            hex::encode(hasher.finalize())
        });

        let path = config_dir.join(format!("{name}.repo"));
        tokio::fs::write(&path, body).await?;
        info!(repo = %name, path = %path.display(), "materialized repo file");
    }

    Ok(())
}

/// Ensure `builds/latest` points at `builds/<build_id>` as a relative
/// symlink, if a prior `meta.json` carries a build id. Idempotent: only
/// created if missing.
pub async fn ensure_latest_symlink(workspace_root: &Path, build_id: &str) -> Result<()> {
    let builds_dir = workspace_root.join("builds");
    let latest = builds_dir.join("latest");
    if tokio::fs::symlink_metadata(&latest).await.is_ok() {
        return Ok(());
    }
    tokio::fs::create_dir_all(&builds_dir).await?;
    let target = PathBuf::from(build_id);
    if let Err(e) = tokio::fs::symlink(&target, &latest).await {
        warn!(error = %e, "failed to create builds/latest symlink");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn latest_symlink_is_created_once() {
        let tmp = TempDir::new().unwrap();
        ensure_latest_symlink(tmp.path(), "39.20240101.0").await.unwrap();
        let latest = tmp.path().join("builds/latest");
        let meta = tokio::fs::symlink_metadata(&latest).await.unwrap();
        assert!(meta.file_type().is_symlink());

        // Second call is a no-op even with a different build id.
        ensure_latest_symlink(tmp.path(), "40.0.0").await.unwrap();
        let target = tokio::fs::read_link(&latest).await.unwrap();
        assert_eq!(target, PathBuf::from("39.20240101.0"));
    }

    #[tokio::test]
    async fn materialize_inline_repo_file_uses_body_sha_when_unnamed() {
        let tmp = TempDir::new().unwrap();
        let http = reqwest::Client::new();
        let repos = vec![RepoFile {
            name: None,
            source: RepoFileSource::Inline("[test]\nbaseurl=http://example".to_string()),
        }];
        materialize_repo_files(&http, tmp.path(), &repos).await.unwrap();

        let mut entries = tokio::fs::read_dir(tmp.path().join("src/config"))
            .await
            .unwrap();
        let entry = entries.next_entry().await.unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().ends_with(".repo"));
    }
}

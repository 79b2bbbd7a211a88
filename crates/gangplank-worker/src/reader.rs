//! The seam between the worker and the (out-of-scope) assembler's own
//! build-state I/O. Gangplank does not implement the assembler; this trait
//! is injected at worker construction so commands can read prior build
//! state from either the local filesystem or the object store without the
//! worker hard-coding which.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[async_trait]
pub trait AssemblerReader: Send + Sync {
    /// Read and parse `builds/latest/meta.json`, if present.
    async fn read_meta(&self, workspace_root: &Path) -> Result<Option<Value>>;

    /// Read and parse `builds.json`, if present.
    async fn read_builds(&self, workspace_root: &Path) -> Result<Option<Value>>;
}

/// Reads build state straight off the worker's local workspace, the mode
/// used when the worker's own pod has already reconstructed the prior
/// build's files via `RemoteFile`s.
pub struct LocalFsAssemblerReader;

#[async_trait]
impl AssemblerReader for LocalFsAssemblerReader {
    async fn read_meta(&self, workspace_root: &Path) -> Result<Option<Value>> {
        read_json_if_present(&workspace_root.join("builds/latest/meta.json")).await
    }

    async fn read_builds(&self, workspace_root: &Path) -> Result<Option<Value>> {
        read_json_if_present(&workspace_root.join("builds.json")).await
    }
}

async fn read_json_if_present(path: &Path) -> Result<Option<Value>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_meta_is_none() {
        let tmp = TempDir::new().unwrap();
        let reader = LocalFsAssemblerReader;
        assert!(reader.read_meta(tmp.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn present_meta_is_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::create_dir_all(tmp.path().join("builds/latest")).await.unwrap();
        tokio::fs::write(
            tmp.path().join("builds/latest/meta.json"),
            r#"{"ostree-commit": "abc"}"#,
        )
        .await
        .unwrap();

        let reader = LocalFsAssemblerReader;
        let meta = reader.read_meta(tmp.path()).await.unwrap().unwrap();
        assert_eq!(meta["ostree-commit"], "abc");
    }
}

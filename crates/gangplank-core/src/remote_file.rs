//! Addressable artifact descriptors shuttled through the object store.
//!
//! `RemoteFile` is a pure data descriptor here; the I/O behind `Fetch` and
//! `Extract` lives in `gangplank-worker`, which is the crate that actually
//! owns a store client. Keeping the descriptor in `gangplank-core` lets both
//! the supervisor (building `WorkSpec`s) and the worker (consuming them)
//! depend on the same type without the worker's I/O stack leaking upward.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An artifact handle: store coordinates plus enough placement information
/// for the worker to know where on disk it belongs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    pub bucket: String,
    pub object: String,

    /// If true, the object is a tar archive to be decompressed in place
    /// rather than written verbatim.
    pub compressed: bool,

    /// Absolute destination overriding the default `/srv/<bucket>/<object>`.
    pub force_path: Option<PathBuf>,

    /// Destination directory for extraction; defaults to the workspace
    /// root when absent.
    pub force_extract_path: Option<PathBuf>,
}

impl RemoteFile {
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            compressed: false,
            force_path: None,
            force_extract_path: None,
        }
    }

    pub fn compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Where a non-compressed `Fetch` writes this file, given the run's
    /// workspace root.
    pub fn fetch_path(&self, workspace_root: &std::path::Path) -> PathBuf {
        self.force_path
            .clone()
            .unwrap_or_else(|| workspace_root.join(&self.bucket).join(&self.object))
    }

    /// Where a compressed `Extract` unpacks this archive, given the run's
    /// workspace root.
    pub fn extract_path(&self, workspace_root: &std::path::Path) -> PathBuf {
        self.force_extract_path
            .clone()
            .unwrap_or_else(|| workspace_root.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn default_fetch_path_is_bucket_object_under_root() {
        let rf = RemoteFile::new("builder", "meta.json");
        assert_eq!(
            rf.fetch_path(Path::new("/srv")),
            PathBuf::from("/srv/builder/meta.json")
        );
    }

    #[test]
    fn force_path_overrides_default() {
        let mut rf = RemoteFile::new("builder", "meta.json");
        rf.force_path = Some(PathBuf::from("/srv/meta.json"));
        assert_eq!(rf.fetch_path(Path::new("/srv")), PathBuf::from("/srv/meta.json"));
    }

    #[test]
    fn default_extract_path_is_workspace_root() {
        let rf = RemoteFile::new("builder", "source.bin").compressed();
        assert_eq!(rf.extract_path(Path::new("/srv")), PathBuf::from("/srv"));
    }
}

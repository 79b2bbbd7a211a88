//! Repo files a `JobSpec` declares, materialized by a worker into
//! `src/config/<name>.repo` before any stage command runs.

use serde::{Deserialize, Serialize};

/// Where a repo file's body comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoFileSource {
    /// Fetched verbatim from this URL.
    Remote(String),
    /// Written verbatim; `name` defaults to the SHA-256 of the body when
    /// absent.
    Inline(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoFile {
    #[serde(default)]
    pub name: Option<String>,
    pub source: RepoFileSource,
}

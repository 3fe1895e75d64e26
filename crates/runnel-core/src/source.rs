//! Source control capability used for ref ingestion and workspace exports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::{Repository, Result};

/// One line of a `for-each-ref` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefInfo {
    pub name: String,
    pub sha: String,
    pub commit_date: DateTime<Utc>,
    pub author: String,
    pub subject: String,
    pub committer: String,
}

/// Version control plumbing for one repository.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Bring the local mirror up to date with the remote.
    async fn fetch(&self, refspecs: &[String]) -> Result<()>;

    /// All refs, newest commit first.
    async fn for_each_ref(&self) -> Result<Vec<RefInfo>>;

    /// Write the tree of `treeish` into `dest`.
    async fn export(&self, treeish: &str, dest: &Path) -> Result<()>;

    async fn merge_base(&self, a: &str, b: &str) -> Result<String>;

    /// Commit date of `sha`.
    async fn log_one(&self, sha: &str) -> Result<DateTime<Utc>>;
}

/// Opens the source control client of a repository.
pub trait SourceProvider: Send + Sync {
    fn source(&self, repo: &Repository) -> Arc<dyn SourceControl>;
}

//! Hosting provider capability: pull requests and commit statuses.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{HostingKind, Repository};

/// Commit status states understood by hosting providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Payload of a commit status push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: CommitState,
    pub target_url: String,
    pub description: String,
    pub context: String,
}

/// Provider-neutral access to a hosting service.
///
/// Network failures never surface: metadata lookups degrade to `None` and
/// status pushes are logged and dropped.
#[async_trait]
pub trait HostingClient: Send + Sync {
    fn kind(&self) -> HostingKind;

    /// Raw pull request metadata, `None` when unknown.
    async fn fetch_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> Option<serde_json::Value>;

    /// Name of the branch the pull request is tied to.
    async fn fetch_pull_request_branch(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> Option<String>;

    async fn push_commit_status(&self, owner: &str, repo: &str, sha: &str, status: &CommitStatus);

    fn branch_url(&self, owner: &str, repo: &str, branch: &str) -> String;

    fn pull_request_url(&self, owner: &str, repo: &str, number: &str) -> String;
}

/// Looks up the hosting client of a repository.
pub trait HostingProvider: Send + Sync {
    /// `None` when the repository has no API access configured.
    fn hosting(&self, repo: &Repository) -> Option<Arc<dyn HostingClient>>;

    /// Client for formatting web links, available without credentials.
    fn links(&self, repo: &Repository) -> Arc<dyn HostingClient>;
}

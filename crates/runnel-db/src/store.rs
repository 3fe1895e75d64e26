//! Build store trait and query types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runnel_core::{Branch, BranchId, Build, BuildId, BuildLink, BuildResult, BuildState, RepoId};
use serde::{Deserialize, Serialize};

use crate::DbResult;

/// Fields of a branch to insert.
#[derive(Debug, Clone)]
pub struct NewBranch {
    pub repo: RepoId,
    pub name: String,
    pub sticky: bool,
}

/// Fields of a build to insert. The store assigns the id.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub branch: BranchId,
    pub repo: RepoId,
    pub sha: String,
    pub author: String,
    pub committer: String,
    pub subject: String,
    pub commit_date: Option<DateTime<Utc>>,
    pub state: BuildState,
    pub link: Option<BuildLink>,
    pub modules: Option<String>,
    pub nickname: String,
    /// Explicit scheduling position; a fresh one is assigned when unset.
    pub sequence: Option<i64>,
}

/// Predicate over builds. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildFilter {
    pub repos: Option<Vec<RepoId>>,
    pub branch: Option<BranchId>,
    pub sha: Option<String>,
    pub states: Option<Vec<BuildState>>,
    pub host: Option<String>,
    /// Match on the sticky flag of the build's branch.
    pub sticky: Option<bool>,
    /// Only builds without any link.
    pub unlinked: bool,
    /// Only builds whose result is not `skipped`.
    pub not_skipped: bool,
    pub exclude: Option<BuildId>,
}

impl BuildFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repo(mut self, repo: &RepoId) -> Self {
        self.repos = Some(vec![repo.clone()]);
        self
    }

    pub fn repos<'a>(mut self, repos: impl IntoIterator<Item = &'a RepoId>) -> Self {
        self.repos = Some(repos.into_iter().cloned().collect());
        self
    }

    pub fn branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn state(mut self, state: BuildState) -> Self {
        self.states = Some(vec![state]);
        self
    }

    pub fn states(mut self, states: &[BuildState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn sticky(mut self, sticky: bool) -> Self {
        self.sticky = Some(sticky);
        self
    }

    pub fn unlinked(mut self) -> Self {
        self.unlinked = true;
        self
    }

    pub fn not_skipped(mut self) -> Self {
        self.not_skipped = true;
        self
    }

    pub fn exclude(mut self, id: BuildId) -> Self {
        self.exclude = Some(id);
        self
    }

    /// Whether `build` satisfies every predicate. `branch_sticky` is the
    /// sticky flag of the build's branch.
    pub fn matches(&self, build: &Build, branch_sticky: bool) -> bool {
        if let Some(repos) = &self.repos {
            if !repos.contains(&build.repo) {
                return false;
            }
        }
        if self.branch.is_some_and(|b| b != build.branch) {
            return false;
        }
        if self.sha.as_deref().is_some_and(|sha| sha != build.sha) {
            return false;
        }
        if let Some(states) = &self.states {
            if !states.contains(&build.state) {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if build.host.as_ref() != Some(host) {
                return false;
            }
        }
        if self.sticky.is_some_and(|s| s != branch_sticky) {
            return false;
        }
        if self.unlinked && build.link.is_some() {
            return false;
        }
        if self.not_skipped && build.is_skipped() {
            return false;
        }
        if self.exclude == Some(build.id) {
            return false;
        }
        true
    }
}

/// Ordering of search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildOrder {
    /// Scheduling order: lowest sequence first, ties by id.
    #[default]
    SequenceAsc,
    SequenceDesc,
    /// Newest first.
    IdDesc,
}

/// Partial update of a build. `None` leaves a field untouched; clearable
/// fields take an inner `Option`.
#[derive(Debug, Clone, Default)]
pub struct BuildPatch {
    pub state: Option<BuildState>,
    pub result: Option<Option<BuildResult>>,
    pub job: Option<Option<String>>,
    pub job_start: Option<Option<DateTime<Utc>>>,
    pub job_end: Option<Option<DateTime<Utc>>>,
    pub host: Option<Option<String>>,
    pub port: Option<Option<u16>>,
    pub pid: Option<Option<i32>>,
    pub link: Option<Option<BuildLink>>,
    pub sequence: Option<i64>,
}

impl BuildPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: BuildState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn result(mut self, result: Option<BuildResult>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn job(mut self, job: Option<String>) -> Self {
        self.job = Some(job);
        self
    }

    pub fn job_start(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.job_start = Some(at);
        self
    }

    pub fn job_end(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.job_end = Some(at);
        self
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn pid(mut self, pid: Option<i32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn link(mut self, link: Option<BuildLink>) -> Self {
        self.link = Some(link);
        self
    }

    pub fn sequence(mut self, sequence: i64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn apply(self, build: &mut Build) {
        if let Some(state) = self.state {
            build.state = state;
        }
        if let Some(result) = self.result {
            build.result = result;
        }
        if let Some(job) = self.job {
            build.job = job;
        }
        if let Some(at) = self.job_start {
            build.job_start = at;
        }
        if let Some(at) = self.job_end {
            build.job_end = at;
        }
        if let Some(host) = self.host {
            build.host = host;
        }
        if let Some(port) = self.port {
            build.port = port;
        }
        if let Some(pid) = self.pid {
            build.pid = pid;
        }
        if let Some(link) = self.link {
            build.link = link;
        }
        if let Some(sequence) = self.sequence {
            build.sequence = sequence;
        }
    }
}

/// Admission of a pending build into the first stage.
#[derive(Debug, Clone)]
pub struct Claim {
    pub host: String,
    pub port: u16,
    pub job: String,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn find_branch(&self, repo: &RepoId, name: &str) -> DbResult<Option<Branch>>;
    /// Fails with `Duplicate` when (repo, name) already exists.
    async fn create_branch(&self, branch: NewBranch) -> DbResult<Branch>;
    async fn get_branch(&self, id: BranchId) -> DbResult<Branch>;
    async fn list_branches(&self, repo: &RepoId) -> DbResult<Vec<Branch>>;
    async fn set_branch_sticky(&self, id: BranchId, sticky: bool) -> DbResult<Branch>;

    async fn get_build(&self, id: BuildId) -> DbResult<Build>;
    async fn search_builds(
        &self,
        filter: &BuildFilter,
        order: BuildOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> DbResult<Vec<Build>>;
    async fn count_builds(&self, filter: &BuildFilter) -> DbResult<usize>;
    async fn create_build(&self, build: NewBuild) -> DbResult<Build>;
    async fn update_build(&self, id: BuildId, patch: BuildPatch) -> DbResult<Build>;

    /// Move a build from `pending` to `testing` on `claim.port`, atomically
    /// with respect to other writers. Returns `None` when the build is no
    /// longer pending or the port is held by another build.
    async fn claim_build(&self, id: BuildId, claim: Claim) -> DbResult<Option<Build>>;

    /// First build in `order` matching `filter`.
    async fn first_build(&self, filter: &BuildFilter, order: BuildOrder) -> DbResult<Option<Build>> {
        Ok(self
            .search_builds(filter, order, Some(1), 0)
            .await?
            .into_iter()
            .next())
    }
}

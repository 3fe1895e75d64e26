//! Branch and build records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BranchId, BuildId, RepoId};

/// A ref of a watched repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: BranchId,
    pub repo: RepoId,
    /// Full ref name, e.g. `refs/heads/main` or `refs/pull/42`.
    pub name: String,
    /// Long-lived branch: always tested, never aged out.
    pub sticky: bool,
}

impl Branch {
    /// Last path segment of the ref name.
    pub fn short_name(&self) -> &str {
        short_name(&self.name)
    }

    /// Pull request number for `refs/pull/N` refs.
    pub fn pull_number(&self) -> Option<&str> {
        self.name.strip_prefix("refs/pull/")
    }

    pub fn is_head(&self) -> bool {
        self.name.starts_with("refs/heads/")
    }

    /// Sanitized branch segment used in build directory names.
    pub fn nickname(&self) -> String {
        let segment = self.name.split('/').nth(2).unwrap_or(self.short_name());
        dashes(segment).chars().take(32).collect()
    }
}

/// Last path segment of a ref name.
pub fn short_name(ref_name: &str) -> &str {
    ref_name.rsplit('/').next().unwrap_or(ref_name)
}

/// Whether a short branch name designates a pull request.
pub fn is_pull_request(short_name: &str) -> bool {
    !short_name.is_empty() && short_name.chars().all(|c| c.is_ascii_digit())
}

fn dashes(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '~' | '"' | ':' | '\''))
        .map(|c| if matches!(c, '/' | '_' | '.' | ' ') { '-' } else { c })
        .collect()
}

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    Pending,
    Testing,
    Running,
    Done,
    Duplicate,
}

impl BuildState {
    /// A stage process may be alive for this build.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, BuildState::Testing | BuildState::Running)
    }

    /// Holds a port allocation.
    pub fn holds_port(&self) -> bool {
        !matches!(self, BuildState::Pending | BuildState::Done)
    }
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildState::Pending => "pending",
            BuildState::Testing => "testing",
            BuildState::Running => "running",
            BuildState::Done => "done",
            BuildState::Duplicate => "duplicate",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BuildState::Pending),
            "testing" => Ok(BuildState::Testing),
            "running" => Ok(BuildState::Running),
            "done" => Ok(BuildState::Done),
            "duplicate" => Ok(BuildState::Duplicate),
            _ => Err(format!("Unknown build state: {}", s)),
        }
    }
}

/// Outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildResult {
    Ok,
    Ko,
    Warn,
    Skipped,
    Killed,
}

impl std::fmt::Display for BuildResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildResult::Ok => "ok",
            BuildResult::Ko => "ko",
            BuildResult::Warn => "warn",
            BuildResult::Skipped => "skipped",
            BuildResult::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for BuildResult {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(BuildResult::Ok),
            "ko" => Ok(BuildResult::Ko),
            "warn" => Ok(BuildResult::Warn),
            "skipped" => Ok(BuildResult::Skipped),
            "killed" => Ok(BuildResult::Killed),
            _ => Err(format!("Unknown build result: {}", s)),
        }
    }
}

/// Relation between two equivalent builds of paired repositories.
///
/// A duplicate build mirrors the results of the build it was matched
/// against; that build in turn forwards every status it reports to the
/// duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildLink {
    Mirrors(BuildId),
    Forwards(BuildId),
}

impl BuildLink {
    pub fn target(&self) -> BuildId {
        match self {
            BuildLink::Mirrors(id) | BuildLink::Forwards(id) => *id,
        }
    }
}

/// A commit of a branch going through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub branch: BranchId,
    pub repo: RepoId,
    /// Commit sha.
    pub sha: String,
    pub author: String,
    pub committer: String,
    pub subject: String,
    pub commit_date: Option<DateTime<Utc>>,
    /// Scheduling order; lower runs first.
    pub sequence: i64,
    pub state: BuildState,
    pub result: Option<BuildResult>,
    /// Current pipeline stage.
    pub job: Option<String>,
    pub job_start: Option<DateTime<Utc>>,
    pub job_end: Option<DateTime<Utc>>,
    /// Scheduler instance that claimed the build.
    pub host: Option<String>,
    /// Primary port; the next port is reserved too.
    pub port: Option<u16>,
    /// Process group leader of the current stage.
    pub pid: Option<i32>,
    pub link: Option<BuildLink>,
    pub modules: Option<String>,
    /// Branch nickname captured at creation.
    pub nickname: String,
}

impl Build {
    /// Directory and database prefix for this build.
    pub fn dest(&self) -> String {
        let short_sha: String = self.sha.chars().take(6).collect();
        format!("{:05}-{}-{}", self.id.get(), self.nickname, short_sha)
    }

    /// Build mirrored by this duplicate.
    pub fn mirrored(&self) -> Option<BuildId> {
        match self.link {
            Some(BuildLink::Mirrors(id)) => Some(id),
            _ => None,
        }
    }

    /// Duplicate receiving this build's statuses.
    pub fn forwarded(&self) -> Option<BuildId> {
        match self.link {
            Some(BuildLink::Forwards(id)) => Some(id),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.result == Some(BuildResult::Skipped)
    }

    /// Seconds spent in the pipeline, up to `now` while unfinished.
    pub fn job_time(&self, now: DateTime<Utc>) -> i64 {
        match (self.job_start, self.job_end) {
            (Some(start), Some(end)) => (end - start).num_seconds(),
            (Some(start), None) => (now - start).num_seconds(),
            _ => 0,
        }
    }
}

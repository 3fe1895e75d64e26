//! Build creation with duplicate detection across paired repositories.

use chrono::{DateTime, Utc};
use runnel_core::source::RefInfo;
use runnel_core::{Branch, Build, BuildLink, BuildState, Repository};
use runnel_db::{BuildFilter, BuildOrder, BuildPatch, NewBuild};
use tracing::info;

use crate::{Context, Result, status};

/// Commit metadata a build is created from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub sha: String,
    pub author: String,
    pub committer: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
}

impl From<&RefInfo> for Commit {
    fn from(r: &RefInfo) -> Self {
        Self {
            sha: r.sha.clone(),
            author: r.author.clone(),
            committer: r.committer.clone(),
            subject: r.subject.clone(),
            date: Some(r.commit_date),
        }
    }
}

impl From<&Build> for Commit {
    fn from(b: &Build) -> Self {
        Self {
            sha: b.sha.clone(),
            author: b.author.clone(),
            committer: b.committer.clone(),
            subject: b.subject.clone(),
            date: b.commit_date,
        }
    }
}

/// Create a pending build, or a duplicate when the paired repository
/// already has an unlinked, non-skipped build of the same commit.
///
/// The duplicate mirrors the matched build and the matched build forwards
/// its statuses to the duplicate. `sequence` overrides the store's next
/// sequence number.
pub async fn create_build(
    ctx: &Context,
    repo: &Repository,
    branch: &Branch,
    commit: Commit,
    sequence: Option<i64>,
) -> Result<Build> {
    let twin = match &repo.dedup_target {
        Some(target) => {
            let filter = BuildFilter::new()
                .repo(target)
                .sha(commit.sha.clone())
                .unlinked()
                .not_skipped();
            ctx.store.first_build(&filter, BuildOrder::IdDesc).await?
        }
        None => None,
    };

    let mut new = NewBuild {
        branch: branch.id,
        repo: repo.id.clone(),
        sha: commit.sha,
        author: commit.author,
        committer: commit.committer,
        subject: commit.subject,
        commit_date: commit.date,
        state: BuildState::Pending,
        link: None,
        modules: repo.modules.clone(),
        nickname: branch.nickname(),
        sequence,
    };

    let Some(twin) = twin else {
        let build = ctx.store.create_build(new).await?;
        info!(build_id = %build.id, repo = %repo.id, branch = %branch.name, sha = %build.sha, "Created build");
        return Ok(build);
    };

    new.state = BuildState::Duplicate;
    new.link = Some(BuildLink::Mirrors(twin.id));
    let build = ctx.store.create_build(new).await?;
    ctx.store
        .update_build(twin.id, BuildPatch::new().link(Some(BuildLink::Forwards(build.id))))
        .await?;
    info!(
        build_id = %build.id,
        mirrors = %twin.id,
        repo = %repo.id,
        sha = %build.sha,
        "Created duplicate build"
    );

    if twin.state != BuildState::Pending {
        status::push(ctx, &build).await;
    }
    Ok(build)
}

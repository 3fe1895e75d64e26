//! Commit status propagation.

use runnel_core::hosting::{CommitState, CommitStatus};
use runnel_core::{Build, BuildResult, BuildState};
use tracing::{debug, warn};

use crate::Context;

/// Hosting status for `build`, reporting the progress of `reported`.
///
/// `reported` is the build itself, or the mirrored build for a duplicate.
/// Builds not started yet have nothing to report.
pub fn describe(ctx: &Context, build: &Build, reported: &Build) -> Option<CommitStatus> {
    let mut description = format!("runbot build {}", build.dest());
    let state = match reported.state {
        BuildState::Testing => CommitState::Pending,
        BuildState::Running | BuildState::Done => {
            description.push_str(&format!(" (runtime {}s)", reported.job_time(ctx.now())));
            match reported.result {
                Some(BuildResult::Ok) => CommitState::Success,
                Some(BuildResult::Killed) => CommitState::Error,
                _ => CommitState::Failure,
            }
        }
        BuildState::Pending | BuildState::Duplicate => return None,
    };

    let domain = ctx.settings.domain.as_deref().unwrap_or(&ctx.host);
    Some(CommitStatus {
        state,
        target_url: format!("http://{}/runbot/build/{}", domain, build.id),
        description,
        context: ctx.settings.status_context.clone(),
    })
}

/// Push the status of `build`, and of the duplicate it forwards to.
///
/// Failures are logged; reporting never fails the caller.
pub async fn push(ctx: &Context, build: &Build) {
    if let Some(duplicate) = build.forwarded() {
        match ctx.store.get_build(duplicate).await {
            Ok(duplicate) => push_one(ctx, &duplicate).await,
            Err(e) => warn!(build_id = %build.id, %duplicate, error = %e, "Forwarded build missing"),
        }
    }
    push_one(ctx, build).await;
}

async fn push_one(ctx: &Context, build: &Build) {
    let reported = match build.mirrored() {
        Some(id) if build.state == BuildState::Duplicate => match ctx.store.get_build(id).await {
            Ok(mirrored) => mirrored,
            Err(e) => {
                warn!(build_id = %build.id, mirrored = %id, error = %e, "Mirrored build missing");
                return;
            }
        },
        _ => build.clone(),
    };

    let Some(status) = describe(ctx, build, &reported) else {
        return;
    };
    let repo = match ctx.repository(&build.repo) {
        Ok(repo) => repo,
        Err(e) => {
            warn!(build_id = %build.id, error = %e, "Cannot report status");
            return;
        }
    };
    let Some(client) = ctx.hosting.hosting(repo) else {
        debug!(build_id = %build.id, repo = %repo.id, "No hosting access, status not pushed");
        return;
    };
    let base = match repo.base() {
        Ok(base) => base,
        Err(e) => {
            warn!(build_id = %build.id, error = %e, "Cannot report status");
            return;
        }
    };
    client
        .push_commit_status(&base.owner, &base.name, &build.sha, &status)
        .await;
}

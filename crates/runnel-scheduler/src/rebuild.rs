//! Operator-facing skip and force-rebuild.

use runnel_core::{Build, BuildId, BuildResult, BuildState};
use runnel_db::{BuildFilter, BuildOrder, BuildPatch};
use tracing::{info, warn};

use crate::dedup::{self, Commit};
use crate::{Context, Result, SchedulerError};

/// Mark `builds` as done/skipped.
///
/// Skipped builds carrying a link are force-rebuilt right away so their
/// paired build never mirrors a skipped one.
pub async fn skip(ctx: &Context, builds: &[Build]) -> Result<usize> {
    let mut relinked = Vec::new();
    for build in builds {
        let skipped = ctx
            .store
            .update_build(
                build.id,
                BuildPatch::new()
                    .state(BuildState::Done)
                    .result(Some(BuildResult::Skipped))
                    .job(None)
                    .port(None),
            )
            .await?;
        info!(build_id = %skipped.id, repo = %skipped.repo, "Skipped build");
        if skipped.link.is_some() {
            relinked.push(skipped.id);
        }
    }

    for id in relinked {
        if let Err(e) = force_rebuild(ctx, id).await {
            warn!(build_id = %id, error = %e, "Cannot requeue linked build");
        }
    }
    Ok(builds.len())
}

/// Queue `id` again, ahead of every pending build.
///
/// A skipped build goes back to pending in place. A build that already ran
/// or mirrors another is left untouched and a new build of the same commit
/// is created instead.
pub async fn force_rebuild(ctx: &Context, id: BuildId) -> Result<Build> {
    let build = ctx.store.get_build(id).await?;
    let oldest = ctx
        .store
        .first_build(
            &BuildFilter::new().state(BuildState::Pending),
            BuildOrder::SequenceAsc,
        )
        .await?;
    let sequence = oldest.map(|b| b.sequence - 1);

    match build.state {
        BuildState::Done if build.is_skipped() => {
            let patch = BuildPatch::new()
                .state(BuildState::Pending)
                .result(None)
                .sequence(sequence.unwrap_or(build.sequence))
                .job(None)
                .job_start(None)
                .job_end(None)
                .host(None)
                .port(None)
                .pid(None);
            let build = ctx.store.update_build(id, patch).await?;
            info!(build_id = %build.id, sequence = build.sequence, "Requeued skipped build");
            Ok(build)
        }
        BuildState::Running | BuildState::Done | BuildState::Duplicate => {
            let repo = ctx.repository(&build.repo)?;
            let branch = ctx.store.get_branch(build.branch).await?;
            let rebuilt =
                dedup::create_build(ctx, repo, &branch, Commit::from(&build), sequence).await?;
            info!(build_id = %build.id, rebuild = %rebuilt.id, "Forced rebuild");
            Ok(rebuilt)
        }
        BuildState::Pending | BuildState::Testing => Err(SchedulerError::InvalidState {
            id,
            state: build.state,
            message: "already queued or testing".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::Harness;
    use runnel_core::BuildLink;

    #[tokio::test]
    async fn test_skipped_build_jumps_the_queue() {
        let h = Harness::new();
        let app = h.app.clone();
        let branch = h.branch(&app, "refs/heads/feature").await;
        let skipped = h.build_on(&branch, "aaa").await;
        let queued = h.build_on(&branch, "bbb").await;
        h.build_on(&branch, "ccc").await;
        skip(&h.ctx, &[skipped.clone()]).await.unwrap();

        let forced = force_rebuild(&h.ctx, skipped.id).await.unwrap();
        assert_eq!(forced.id, skipped.id);
        assert_eq!(forced.state, BuildState::Pending);
        assert_eq!(forced.result, None);
        assert_eq!(forced.sequence, queued.sequence - 1);

        let next = h
            .ctx
            .store
            .first_build(&BuildFilter::new().state(BuildState::Pending), BuildOrder::SequenceAsc)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, skipped.id);
    }

    #[tokio::test]
    async fn test_finished_build_is_cloned() {
        let h = Harness::new();
        let app = h.app.clone();
        let branch = h.branch(&app, "refs/heads/main").await;
        let done = h.build_on(&branch, "aaa").await;
        h.ctx
            .store
            .update_build(
                done.id,
                BuildPatch::new()
                    .state(BuildState::Done)
                    .result(Some(BuildResult::Ok)),
            )
            .await
            .unwrap();

        let forced = force_rebuild(&h.ctx, done.id).await.unwrap();
        assert_ne!(forced.id, done.id);
        assert_eq!(forced.state, BuildState::Pending);
        assert_eq!(forced.sha, "aaa");
        assert_eq!(forced.branch, branch.id);
        // History untouched
        let done = h.ctx.store.get_build(done.id).await.unwrap();
        assert_eq!(done.result, Some(BuildResult::Ok));
    }

    #[tokio::test]
    async fn test_pending_cannot_be_forced() {
        let h = Harness::new();
        let app = h.app.clone();
        let pending = h.build_on(&h.branch(&app, "refs/heads/main").await, "aaa").await;
        let err = force_rebuild(&h.ctx, pending.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_skipping_a_forwarding_build_requeues_it() {
        let h = Harness::new();
        let app = h.app.clone();
        let branch = h.branch(&app, "refs/heads/main").await;
        let twin = h.build_on(&branch, "aaa").await;
        let twin = h
            .ctx
            .store
            .update_build(twin.id, BuildPatch::new().link(Some(BuildLink::Forwards(BuildId::new(99)))))
            .await
            .unwrap();
        let plain = h.build_on(&branch, "bbb").await;

        skip(&h.ctx, &[twin.clone(), plain.clone()]).await.unwrap();

        let twin = h.ctx.store.get_build(twin.id).await.unwrap();
        assert_eq!(twin.state, BuildState::Pending);
        assert_eq!(twin.result, None);
        let plain = h.ctx.store.get_build(plain.id).await.unwrap();
        assert_eq!(plain.state, BuildState::Done);
        assert_eq!(plain.result, Some(BuildResult::Skipped));
    }
}

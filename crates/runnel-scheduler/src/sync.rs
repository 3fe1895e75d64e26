//! Ref ingestion.
//!
//! Fetches a repository, lists its refs newest first and turns them into
//! branch and build records. Old feature branches are ignored, superseded
//! pending builds are skipped and the pending queue is capped to what the
//! running budget could ever serve.

use chrono::Duration;
use runnel_core::build::short_name;
use runnel_core::source::RefInfo;
use runnel_core::{Branch, BuildState, HostingKind, Repository};
use runnel_db::{BuildFilter, BuildOrder, NewBranch};
use tracing::{debug, info};

use crate::dedup::{self, Commit};
use crate::{Context, Result, SchedulerError, rebuild};

/// What one ingestion pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub refs: usize,
    pub branches_created: usize,
    pub builds_created: usize,
    /// Refs ignored for being older than the retention window.
    pub expired: usize,
    pub skipped: usize,
}

/// Refspecs kept in sync for a provider.
pub fn refspecs(kind: HostingKind) -> Vec<String> {
    let mut specs = vec![
        "+refs/heads/*:refs/heads/*".to_string(),
        "+refs/tags/*:refs/tags/*".to_string(),
    ];
    if kind == HostingKind::Github {
        specs.push("+refs/pull/*/head:refs/pull/*".to_string());
    }
    specs
}

pub struct RefSyncer<'a> {
    ctx: &'a Context,
}

impl<'a> RefSyncer<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Fetch `repo` and ingest its refs.
    pub async fn sync(&self, repo: &Repository) -> Result<SyncReport> {
        let source = self.ctx.sources.source(repo);
        source
            .fetch(&refspecs(repo.hosting))
            .await
            .map_err(SchedulerError::Source)?;
        let refs = source.for_each_ref().await.map_err(SchedulerError::Source)?;
        self.ingest(repo, &refs).await
    }

    /// Create branch and build records for `refs`.
    ///
    /// Running it again over the same refs creates nothing.
    pub async fn ingest(&self, repo: &Repository, refs: &[RefInfo]) -> Result<SyncReport> {
        let ctx = self.ctx;
        let mut report = SyncReport {
            refs: refs.len(),
            ..Default::default()
        };
        let cutoff = Duration::try_days(ctx.settings.retention_days)
            .and_then(|window| ctx.now().checked_sub_signed(window));

        for r in refs {
            let branch = self.branch_for(repo, &r.name, &mut report).await?;

            if !branch.sticky && cutoff.is_some_and(|cutoff| r.commit_date < cutoff) {
                debug!(repo = %repo.id, branch = %branch.name, "Branch past retention window");
                report.expired += 1;
                continue;
            }

            let known = BuildFilter::new().branch(branch.id).sha(r.sha.clone());
            if ctx.store.count_builds(&known).await? > 0 {
                continue;
            }

            if !branch.sticky {
                let superseded = ctx
                    .store
                    .search_builds(
                        &BuildFilter::new().branch(branch.id).state(BuildState::Pending),
                        BuildOrder::SequenceAsc,
                        None,
                        0,
                    )
                    .await?;
                report.skipped += rebuild::skip(ctx, &superseded).await?;
            }

            dedup::create_build(ctx, repo, &branch, Commit::from(r), None).await?;
            report.builds_created += 1;
        }

        let keep = ctx.settings.running_slots_for(repo);
        let overflow = ctx
            .store
            .search_builds(
                &BuildFilter::new().repo(&repo.id).state(BuildState::Pending),
                BuildOrder::SequenceDesc,
                None,
                keep,
            )
            .await?;
        report.skipped += rebuild::skip(ctx, &overflow).await?;

        info!(
            repo = %repo.id,
            refs = report.refs,
            builds = report.builds_created,
            skipped = report.skipped,
            "Synced repository"
        );
        Ok(report)
    }

    async fn branch_for(
        &self,
        repo: &Repository,
        name: &str,
        report: &mut SyncReport,
    ) -> Result<Branch> {
        let store = &self.ctx.store;
        let sticky = repo.is_sticky_branch(short_name(name));
        match store.find_branch(&repo.id, name).await? {
            Some(branch) if branch.sticky != sticky => {
                Ok(store.set_branch_sticky(branch.id, sticky).await?)
            }
            Some(branch) => Ok(branch),
            None => {
                let branch = store
                    .create_branch(NewBranch {
                        repo: repo.id.clone(),
                        name: name.to_string(),
                        sticky,
                    })
                    .await?;
                debug!(repo = %repo.id, branch = %branch.name, sticky, "Created branch");
                report.branches_created += 1;
                Ok(branch)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Harness, ref_info};
    use runnel_core::BuildResult;

    #[test]
    fn test_refspecs() {
        assert_eq!(refspecs(HostingKind::Github).len(), 3);
        assert!(refspecs(HostingKind::Github).contains(&"+refs/pull/*/head:refs/pull/*".to_string()));
        assert_eq!(
            refspecs(HostingKind::Bitbucket),
            vec!["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"]
        );
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let h = Harness::new();
        let app = h.app.clone();
        h.source(&app).set_refs(vec![
            ref_info("refs/heads/main", "aaa", 1),
            ref_info("refs/heads/feature", "bbb", 2),
            ref_info("refs/pull/42", "ccc", 3),
        ]);
        let syncer = RefSyncer::new(&h.ctx);

        let first = syncer.sync(&app).await.unwrap();
        assert_eq!(first.branches_created, 3);
        assert_eq!(first.builds_created, 3);
        assert_eq!(h.source(&app).fetches(), vec![refspecs(HostingKind::Github)]);

        let second = syncer.sync(&app).await.unwrap();
        assert_eq!(second.branches_created, 0);
        assert_eq!(second.builds_created, 0);
        assert_eq!(h.ctx.store.list_branches(&app.id).await.unwrap().len(), 3);
        assert_eq!(h.ctx.store.count_builds(&BuildFilter::new()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_sticky_flag_follows_configuration() {
        let h = Harness::new();
        let app = h.app.clone();
        let report = RefSyncer::new(&h.ctx)
            .ingest(&app, &[ref_info("refs/heads/main", "aaa", 0), ref_info("refs/heads/dev", "bbb", 0)])
            .await
            .unwrap();
        assert_eq!(report.branches_created, 2);

        let main = h.ctx.store.find_branch(&app.id, "refs/heads/main").await.unwrap().unwrap();
        let dev = h.ctx.store.find_branch(&app.id, "refs/heads/dev").await.unwrap().unwrap();
        assert!(main.sticky);
        assert!(!dev.sticky);
    }

    #[tokio::test]
    async fn test_old_feature_branch_creates_no_build() {
        let h = Harness::new();
        let app = h.app.clone();
        let report = RefSyncer::new(&h.ctx)
            .ingest(
                &app,
                &[
                    ref_info("refs/heads/stale", "aaa", 31),
                    // Sticky branches never age out
                    ref_info("refs/heads/main", "bbb", 400),
                ],
            )
            .await
            .unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.builds_created, 1);
        // The branch itself is still recorded
        assert!(h.ctx.store.find_branch(&app.id, "refs/heads/stale").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unbounded_retention_keeps_everything() {
        let mut h = Harness::new();
        h.ctx.settings.retention_days = i64::MAX;
        let app = h.app.clone();
        let report = RefSyncer::new(&h.ctx)
            .ingest(&app, &[ref_info("refs/heads/ancient", "aaa", 4000)])
            .await
            .unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(report.builds_created, 1);
    }

    #[tokio::test]
    async fn test_new_commit_supersedes_pending_ones() {
        let h = Harness::new();
        let app = h.app.clone();
        let syncer = RefSyncer::new(&h.ctx);
        syncer.ingest(&app, &[ref_info("refs/heads/feature", "aaa", 1)]).await.unwrap();
        syncer.ingest(&app, &[ref_info("refs/heads/main", "s1", 1)]).await.unwrap();

        let report = syncer.ingest(&app, &[ref_info("refs/heads/feature", "bbb", 0)]).await.unwrap();
        assert_eq!(report.skipped, 1);
        let old = h.ctx.store.first_build(&BuildFilter::new().sha("aaa"), BuildOrder::IdDesc).await.unwrap().unwrap();
        assert_eq!(old.state, BuildState::Done);
        assert_eq!(old.result, Some(BuildResult::Skipped));

        // Sticky branches keep every pending commit
        let report = syncer.ingest(&app, &[ref_info("refs/heads/main", "s2", 0)]).await.unwrap();
        assert_eq!(report.skipped, 0);
        let s1 = h.ctx.store.first_build(&BuildFilter::new().sha("s1"), BuildOrder::IdDesc).await.unwrap().unwrap();
        assert_eq!(s1.state, BuildState::Pending);
    }

    #[tokio::test]
    async fn test_pending_queue_is_capped() {
        let mut h = Harness::new();
        h.ctx.settings.running_slots = 2;
        let mut bitbucket = h.addons.clone();
        bitbucket.running_slots = None;

        let refs: Vec<RefInfo> = (0..5)
            .map(|i| ref_info(&format!("refs/heads/topic-{}", i), &format!("sha{}", i), 0))
            .collect();
        let report = RefSyncer::new(&h.ctx).ingest(&bitbucket, &refs).await.unwrap();
        assert_eq!(report.builds_created, 5);
        assert_eq!(report.skipped, 3);

        let pending = h
            .ctx
            .store
            .search_builds(
                &BuildFilter::new().repo(&bitbucket.id).state(BuildState::Pending),
                BuildOrder::SequenceAsc,
                None,
                0,
            )
            .await
            .unwrap();
        let shas: Vec<&str> = pending.iter().map(|b| b.sha.as_str()).collect();
        assert_eq!(shas, vec!["sha3", "sha4"]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_a_source_error() {
        let h = Harness::new();
        let app = h.app.clone();
        h.source(&app).fail_listing();
        let err = RefSyncer::new(&h.ctx).sync(&app).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Source(_)));
    }
}

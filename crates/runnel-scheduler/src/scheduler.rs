//! Admission and eviction loop.

use runnel_core::{BranchId, Build, BuildId, BuildState, Repository};
use runnel_db::{BuildFilter, BuildOrder, Claim};
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::{Advance, Context, JobPipeline, Result, SchedulerError, ports};

/// Consecutive lost claims after which admission gives up for the tick.
const MAX_LOST_CLAIMS: usize = 3;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub advanced: usize,
    pub finished: usize,
    pub timed_out: usize,
    pub admitted: usize,
    pub evicted: usize,
    pub reaped: usize,
}

pub struct Scheduler<'a> {
    ctx: &'a Context,
}

impl<'a> Scheduler<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// One scheduling pass over `repo` for this host.
    ///
    /// In-flight builds advance first, then pending builds are admitted up
    /// to the testing budget, then running builds beyond the running budget
    /// are terminated. Exited children are reaped last, whatever happened
    /// before.
    pub async fn tick(&self, repo: &Repository) -> Result<TickReport> {
        let mut report = TickReport::default();
        let outcome = self.schedule(repo, &mut report).await;
        report.reaped = self.ctx.runner.reap();
        outcome?;
        debug!(repo = %repo.id, ?report, "Tick complete");
        Ok(report)
    }

    async fn schedule(&self, repo: &Repository, report: &mut TickReport) -> Result<()> {
        self.advance_in_flight(repo, report).await?;
        self.admit(repo, report).await?;
        self.evict(repo, report).await
    }

    async fn advance_in_flight(&self, repo: &Repository, report: &mut TickReport) -> Result<()> {
        let filter = BuildFilter::new()
            .repo(&repo.id)
            .host(self.ctx.host.clone())
            .states(&[BuildState::Testing, BuildState::Running]);
        let builds = self
            .ctx
            .store
            .search_builds(&filter, BuildOrder::SequenceAsc, None, 0)
            .await?;

        let pipeline = JobPipeline::new(self.ctx);
        for build in builds {
            match pipeline.advance(&build).await {
                Ok(Advance::Waiting) => {}
                Ok(Advance::Advanced) => report.advanced += 1,
                Ok(Advance::Finished) => report.finished += 1,
                Ok(Advance::TimedOut) => report.timed_out += 1,
                Err(e) => error!(build_id = %build.id, error = %e, "Failed to advance build"),
            }
        }
        Ok(())
    }

    async fn admit(&self, repo: &Repository, report: &mut TickReport) -> Result<()> {
        let ctx = self.ctx;
        let slots = ctx.settings.testing_slots_for(repo);
        let testing = BuildFilter::new()
            .repo(&repo.id)
            .host(ctx.host.clone())
            .state(BuildState::Testing);
        let pending = BuildFilter::new().repo(&repo.id).state(BuildState::Pending);
        let pipeline = JobPipeline::new(ctx);
        let mut lost = 0;

        while ctx.store.count_builds(&testing).await? < slots
            && ctx.store.count_builds(&pending).await? > 0
        {
            let sticky = pending.clone().sticky(true);
            let next = match ctx.store.first_build(&sticky, BuildOrder::SequenceAsc).await? {
                Some(build) => Some(build),
                None => ctx.store.first_build(&pending, BuildOrder::SequenceAsc).await?,
            };
            let Some(next) = next else {
                break;
            };

            let claim = Claim {
                host: ctx.host.clone(),
                port: ports::allocate(ctx).await?,
                job: ctx.pipeline.first().name.clone(),
                at: ctx.now(),
            };
            let Some(build) = ctx.store.claim_build(next.id, claim).await? else {
                lost += 1;
                warn!(build_id = %next.id, "Lost claim on pending build");
                if lost >= MAX_LOST_CLAIMS {
                    break;
                }
                continue;
            };
            lost = 0;
            report.admitted += 1;

            if let Err(e) = pipeline.start(build).await {
                error!(build_id = %next.id, error = %e, "Failed to start build");
            }
        }
        Ok(())
    }

    async fn evict(&self, repo: &Repository, report: &mut TickReport) -> Result<()> {
        let ctx = self.ctx;
        let filter = BuildFilter::new()
            .repo(&repo.id)
            .host(ctx.host.clone())
            .state(BuildState::Running);
        let running = ctx
            .store
            .search_builds(&filter, BuildOrder::IdDesc, None, 0)
            .await?;

        let mut sticky_cache: HashMap<BranchId, bool> = HashMap::new();
        let mut reserved_branches: HashSet<BranchId> = HashSet::new();
        let mut reserved: Vec<Build> = Vec::new();
        let mut others: Vec<Build> = Vec::new();
        for build in running {
            let sticky = match sticky_cache.get(&build.branch) {
                Some(sticky) => *sticky,
                None => {
                    let sticky = ctx.store.get_branch(build.branch).await?.sticky;
                    sticky_cache.insert(build.branch, sticky);
                    sticky
                }
            };
            if sticky && reserved_branches.insert(build.branch) {
                reserved.push(build);
            } else {
                others.push(build);
            }
        }

        let keep = ctx.settings.running_slots_for(repo);
        let pipeline = JobPipeline::new(ctx);
        for build in reserved.into_iter().chain(others).skip(keep) {
            info!(build_id = %build.id, "Evicting running build");
            match pipeline.terminate(&build).await {
                Ok(_) => report.evicted += 1,
                Err(e) => error!(build_id = %build.id, error = %e, "Failed to evict build"),
            }
        }
        Ok(())
    }

    /// Terminate every in-flight build of this host, then reap.
    pub async fn kill_all(&self) -> Result<usize> {
        let filter = BuildFilter::new()
            .host(self.ctx.host.clone())
            .states(&[BuildState::Testing, BuildState::Running]);
        let builds = self
            .ctx
            .store
            .search_builds(&filter, BuildOrder::SequenceAsc, None, 0)
            .await?;

        let pipeline = JobPipeline::new(self.ctx);
        let mut terminated = 0;
        for build in &builds {
            match pipeline.terminate(build).await {
                Ok(_) => terminated += 1,
                Err(e) => error!(build_id = %build.id, error = %e, "Failed to terminate build"),
            }
        }
        let reaped = self.ctx.runner.reap();
        info!(terminated, reaped, "Killed all builds");
        Ok(terminated)
    }

    /// Kill one in-flight build of this host.
    pub async fn kill(&self, id: BuildId) -> Result<Build> {
        let build = self.ctx.store.get_build(id).await?;
        if !build.state.is_in_flight() {
            return Err(SchedulerError::InvalidState {
                id,
                state: build.state,
                message: "nothing to kill".to_string(),
            });
        }
        if build.host.as_deref() != Some(self.ctx.host.as_str()) {
            return Err(SchedulerError::InvalidState {
                id,
                state: build.state,
                message: format!("owned by host {}", build.host.as_deref().unwrap_or("?")),
            });
        }
        JobPipeline::new(self.ctx).kill(&build).await
    }
}

//! Scheduling and operator commands.

use anyhow::{Context as _, Result, bail};
use runnel_core::{BuildId, RepoId, Repository};
use runnel_scheduler::{Context, RefSyncer, Scheduler, force_rebuild};
use std::time::Duration;
use tracing::{error, info, warn};

fn auto_repositories(ctx: &Context) -> Vec<Repository> {
    ctx.repositories.iter().filter(|r| r.auto).cloned().collect()
}

/// Sync then schedule every auto repository.
///
/// A repository failing to sync is still scheduled; failures never stop
/// the other repositories.
pub async fn tick(ctx: &Context) -> Result<()> {
    let syncer = RefSyncer::new(ctx);
    let scheduler = Scheduler::new(ctx);
    for repo in auto_repositories(ctx) {
        if let Err(e) = syncer.sync(&repo).await {
            warn!(repo = %repo.id, error = %e, "Sync failed");
        }
        match scheduler.tick(&repo).await {
            Ok(report) => info!(
                repo = %repo.id,
                admitted = report.admitted,
                advanced = report.advanced,
                finished = report.finished,
                timed_out = report.timed_out,
                evicted = report.evicted,
                "Scheduled repository"
            ),
            Err(e) => error!(repo = %repo.id, error = %e, "Scheduling failed"),
        }
    }
    Ok(())
}

pub async fn daemon(ctx: &Context, interval: u64) -> Result<()> {
    if interval == 0 {
        bail!("interval must be at least one second");
    }
    info!(interval, host = %ctx.host, "Starting scheduler daemon");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval));
    loop {
        tokio::select! {
            _ = ticker.tick() => tick(ctx).await?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
        }
    }
}

pub async fn sync(ctx: &Context, repo: Option<String>) -> Result<()> {
    let repos = match repo {
        Some(id) => vec![ctx.repository(&RepoId::new(id))?.clone()],
        None => auto_repositories(ctx),
    };
    let syncer = RefSyncer::new(ctx);
    for repo in repos {
        let report = syncer
            .sync(&repo)
            .await
            .with_context(|| format!("syncing {}", repo.id))?;
        println!(
            "{}: {} refs, {} new builds, {} skipped, {} expired",
            repo.id, report.refs, report.builds_created, report.skipped, report.expired
        );
    }
    Ok(())
}

pub async fn force(ctx: &Context, id: i64) -> Result<()> {
    let build = force_rebuild(ctx, BuildId::new(id)).await?;
    println!("Build {} queued with sequence {}", build.id, build.sequence);
    Ok(())
}

pub async fn kill(ctx: &Context, id: i64) -> Result<()> {
    let scheduler = Scheduler::new(ctx);
    let build = scheduler.kill(BuildId::new(id)).await?;
    ctx.runner.reap();
    println!("Build {} killed", build.id);
    Ok(())
}

pub async fn killall(ctx: &Context) -> Result<()> {
    let terminated = Scheduler::new(ctx).kill_all().await?;
    println!("Terminated {} builds", terminated);
    Ok(())
}

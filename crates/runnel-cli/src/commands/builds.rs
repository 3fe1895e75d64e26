//! Build listing.

use anyhow::{Result, anyhow};
use runnel_core::{Build, BuildState, RepoId};
use runnel_db::{BuildFilter, BuildOrder};
use runnel_scheduler::{Context, branch_url, pull_info};
use tracing::warn;

pub async fn list(
    ctx: &Context,
    repo: Option<String>,
    state: Option<String>,
    limit: usize,
    links: bool,
) -> Result<()> {
    let mut filter = BuildFilter::new();
    if let Some(repo) = repo {
        filter = filter.repo(&RepoId::new(repo));
    }
    if let Some(state) = state {
        let state: BuildState = state.parse().map_err(|e: String| anyhow!(e))?;
        filter = filter.state(state);
    }

    let builds = ctx
        .store
        .search_builds(&filter, BuildOrder::IdDesc, Some(limit), 0)
        .await?;
    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }

    println!(
        "{:>6}  {:<9}  {:<7}  {:<9}  {:<6}  DEST",
        "ID", "STATE", "RESULT", "JOB", "PORT"
    );
    for build in builds {
        println!(
            "{:>6}  {:<9}  {:<7}  {:<9}  {:<6}  {}",
            build.id,
            build.state.to_string(),
            build.result.map(|r| r.to_string()).unwrap_or_default(),
            build.job.clone().unwrap_or_default(),
            build.port.map(|p| p.to_string()).unwrap_or_default(),
            build.dest()
        );
        if links {
            if let Err(e) = print_links(ctx, &build).await {
                warn!(build_id = %build.id, error = %e, "Cannot resolve branch links");
            }
        }
    }
    Ok(())
}

async fn print_links(ctx: &Context, build: &Build) -> Result<()> {
    let repo = ctx.repository(&build.repo)?;
    let branch = ctx.store.get_branch(build.branch).await?;
    println!("{:>8}{}", "", branch_url(ctx, repo, &branch)?);
    if let Some(pull) = pull_info(ctx, repo, &branch).await? {
        println!(
            "{:>8}#{} {} -> {}",
            "",
            pull.number,
            pull.title.as_deref().unwrap_or("(untitled)"),
            pull.target.as_deref().unwrap_or("?")
        );
    }
    Ok(())
}

//! Build directories and source checkout.

use runnel_core::build::is_pull_request;
use runnel_core::{Branch, Build, Dependency, Repository};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{Context, Result, SchedulerError};

/// `<root>/build/<dest>` and its `logs/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub fn new(root: &Path, build: &Build) -> Self {
        Self {
            path: root.join("build").join(build.dest()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    /// Lock held by the stage process while it runs.
    pub fn lock_path(&self, stage: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.lock", stage))
    }

    /// Output of the stage process.
    pub fn log_path(&self, stage: &str) -> PathBuf {
        self.logs_dir().join(format!("{}.txt", stage))
    }

    /// Start from an empty directory with its `logs/` subdirectory.
    pub async fn reset(&self) -> Result<()> {
        self.remove().await?;
        tokio::fs::create_dir_all(self.logs_dir()).await?;
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Export the build's commit, then its dependency repositories.
    ///
    /// Flat dependencies follow the closest common branch; each name chosen
    /// becomes a hint for the next dependency. Nested dependencies are
    /// exported at their configured ref.
    pub async fn checkout(&self, ctx: &Context, build: &Build, branch: &Branch) -> Result<()> {
        let repo = ctx.repository(&build.repo)?;
        ctx.sources
            .source(repo)
            .export(&build.sha, &self.path)
            .await
            .map_err(SchedulerError::Source)?;
        info!(build_id = %build.id, path = %self.path.display(), "Exported build sources");

        let mut hints: HashSet<String> = HashSet::new();
        for dependency in &repo.dependencies {
            let Dependency::Flat(dep_id) = dependency else {
                continue;
            };
            let target = ctx.repository(dep_id)?;
            let name = closest_branch_name(ctx, repo, branch, target, &hints).await?;
            debug!(build_id = %build.id, dependency = %dep_id, branch = %name, "Exporting dependency");
            ctx.sources
                .source(target)
                .export(&name, &self.path)
                .await
                .map_err(SchedulerError::Source)?;
            hints.insert(name);
        }

        for dependency in &repo.dependencies {
            let Dependency::Nested { repo: dep_id, reference } = dependency else {
                continue;
            };
            let target = ctx.repository(dep_id)?;
            ctx.sources
                .source(target)
                .export(reference, &self.path)
                .await
                .map_err(SchedulerError::Source)?;
        }
        Ok(())
    }
}

/// Branch of `target` to test alongside `branch` of `repo`.
///
/// Same-named heads win. Otherwise every common head name is a candidate
/// (narrowed to `hints` when some match) and the one whose merge-base with
/// the build's ref is most recent is picked.
pub async fn closest_branch_name(
    ctx: &Context,
    repo: &Repository,
    branch: &Branch,
    target: &Repository,
    hints: &HashSet<String>,
) -> Result<String> {
    let mut name = branch.short_name().to_string();

    if let Some(number) = branch.pull_number() {
        if let Some(client) = ctx.hosting.hosting(repo) {
            let base = repo.base()?;
            if let Some(target_branch) = client
                .fetch_pull_request_branch(&base.owner, &base.name, number)
                .await
            {
                name = target_branch;
            }
        }
    }

    let ours = head_names(ctx, repo).await?;
    let theirs = head_names(ctx, target).await?;
    let mut candidates: BTreeSet<String> = ours.intersection(&theirs).cloned().collect();
    if candidates.contains(&name) {
        return Ok(name);
    }

    let hinted: BTreeSet<String> = candidates
        .iter()
        .filter(|c| hints.contains(*c))
        .cloned()
        .collect();
    if !hinted.is_empty() {
        candidates = hinted;
    }

    let source = ctx.sources.source(repo);
    let mut best: Option<(chrono::DateTime<chrono::Utc>, String)> = None;
    for candidate in candidates {
        let date = match source.merge_base(&branch.name, &candidate).await {
            Ok(sha) => source.log_one(&sha).await,
            Err(e) => Err(e),
        };
        match date {
            Ok(date) => {
                if best.as_ref().is_none_or(|(newest, _)| date > *newest) {
                    best = Some((date, candidate));
                }
            }
            Err(e) => {
                warn!(branch = %branch.name, candidate = %candidate, error = %e, "No merge base");
            }
        }
    }

    if let Some((_, candidate)) = best {
        name = candidate;
    }
    if is_pull_request(&name) {
        warn!(branch = %branch.name, "No common branch found for pull request");
    }
    Ok(name)
}

async fn head_names(ctx: &Context, repo: &Repository) -> Result<HashSet<String>> {
    Ok(ctx
        .store
        .list_branches(&repo.id)
        .await?
        .iter()
        .filter(|b| b.is_head())
        .map(|b| b.short_name().to_string())
        .collect())
}

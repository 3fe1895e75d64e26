//! Web links and pull request details of branches.

use runnel_core::build::is_pull_request;
use runnel_core::{Branch, HostingKind, Repository};
use tracing::debug;

use crate::{Context, Result};

/// Hosting page of `branch`: the pull request page when its short name is a
/// pull request number, the branch tree otherwise.
pub fn branch_url(ctx: &Context, repo: &Repository, branch: &Branch) -> Result<String> {
    let base = repo.base()?;
    let links = ctx.hosting.links(repo);
    let name = branch.short_name();
    Ok(if is_pull_request(name) {
        links.pull_request_url(&base.owner, &base.name, name)
    } else {
        links.branch_url(&base.owner, &base.name, name)
    })
}

/// What the hosting service knows about a pull request branch.
#[derive(Debug, Clone, PartialEq)]
pub struct PullInfo {
    pub number: String,
    pub title: Option<String>,
    /// Branch the pull request merges into.
    pub target: Option<String>,
    pub data: serde_json::Value,
}

impl PullInfo {
    fn new(kind: HostingKind, number: &str, data: serde_json::Value) -> Self {
        let text = |pointer: &str| {
            data.pointer(pointer)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let target = match kind {
            HostingKind::Github => text("/base/ref"),
            HostingKind::Bitbucket => text("/destination/branch/name"),
        };
        Self {
            number: number.to_string(),
            title: text("/title"),
            target,
            data,
        }
    }
}

/// Pull request metadata of a `refs/pull/N` branch.
///
/// `None` for other branches, for repositories without credentials and when
/// the provider does not answer.
pub async fn pull_info(
    ctx: &Context,
    repo: &Repository,
    branch: &Branch,
) -> Result<Option<PullInfo>> {
    let Some(number) = branch.pull_number() else {
        return Ok(None);
    };
    let Some(client) = ctx.hosting.hosting(repo) else {
        debug!(repo = %repo.id, branch = %branch.name, "No hosting credentials for pull request");
        return Ok(None);
    };
    let base = repo.base()?;
    let info = client
        .fetch_pull_request(&base.owner, &base.name, number)
        .await
        .map(|data| PullInfo::new(client.kind(), number, data));
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::Harness;

    #[tokio::test]
    async fn test_branch_url_by_kind_of_branch() {
        let h = Harness::new();
        let app = h.app.clone();
        let feature = h.branch(&app, "refs/heads/feature").await;
        let pull = h.branch(&app, "refs/pull/42").await;

        assert_eq!(
            branch_url(&h.ctx, &app, &feature).unwrap(),
            "https://example.com/acme/app/tree/feature"
        );
        assert_eq!(
            branch_url(&h.ctx, &app, &pull).unwrap(),
            "https://example.com/acme/app/pull/42"
        );

        // No credentials needed for links
        let addons = h.addons.clone();
        let main = h.branch(&addons, "refs/heads/main").await;
        assert!(branch_url(&h.ctx, &addons, &main).unwrap().ends_with("/tree/main"));
    }

    #[tokio::test]
    async fn test_pull_info_for_pull_request_branches() {
        let h = Harness::new();
        let app = h.app.clone();
        h.hosting.set_pull_request_branch("42", "release-1.0");
        let pull = h.branch(&app, "refs/pull/42").await;

        let info = pull_info(&h.ctx, &app, &pull).await.unwrap().unwrap();
        assert_eq!(info.number, "42");
        assert_eq!(info.title.as_deref(), Some("Pull request 42"));
        assert_eq!(info.target.as_deref(), Some("release-1.0"));
    }

    #[tokio::test]
    async fn test_pull_info_skips_heads_and_anonymous_repos() {
        let h = Harness::new();
        let app = h.app.clone();
        h.hosting.set_pull_request_branch("7", "main");
        let head = h.branch(&app, "refs/heads/7").await;
        assert_eq!(pull_info(&h.ctx, &app, &head).await.unwrap(), None);

        let addons = h.addons.clone();
        let pull = h.branch(&addons, "refs/pull/7").await;
        assert_eq!(pull_info(&h.ctx, &addons, &pull).await.unwrap(), None);
        assert_eq!(h.hosting.pull_request_lookups(), 0);

        // Unknown to the provider
        let missing = h.branch(&app, "refs/pull/8").await;
        assert_eq!(pull_info(&h.ctx, &app, &missing).await.unwrap(), None);
        assert_eq!(h.hosting.pull_request_lookups(), 1);
    }
}

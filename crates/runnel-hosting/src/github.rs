//! GitHub REST client.

use async_trait::async_trait;
use runnel_core::hosting::{CommitStatus, HostingClient};
use runnel_core::{Credentials, HostingKind};
use tracing::{debug, warn};

use crate::{HostingError, HostingResult};

pub const API_URL: &str = "https://api.github.com";
pub const WEB_URL: &str = "https://github.com";

const USER_AGENT: &str = "runnel-ci";

/// GitHub API client.
pub struct GitHubClient {
    client: reqwest::Client,
    credentials: Credentials,
    api_url: String,
}

impl GitHubClient {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_api_url(credentials, API_URL)
    }

    /// Client against a GitHub Enterprise or test endpoint.
    pub fn with_api_url(credentials: Credentials, api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.api_url, endpoint))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        match &self.credentials {
            Credentials::Token(token) => builder.header("Authorization", format!("Bearer {}", token)),
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credentials::None => builder,
        }
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> HostingResult<serde_json::Value> {
        let endpoint = format!("/repos/{}/{}/pulls/{}", owner, repo, number);
        let response = self.request(reqwest::Method::GET, &endpoint).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::Api { status, body });
        }

        response
            .json()
            .await
            .map_err(|e| HostingError::Parse(e.to_string()))
    }

    async fn post_status(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> HostingResult<()> {
        let endpoint = format!("/repos/{}/{}/statuses/{}", owner, repo, sha);
        let response = self
            .request(reqwest::Method::POST, &endpoint)
            .json(status)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(HostingError::Api { status, body });
        }
        Ok(())
    }
}

/// Target branch of a pull request payload.
pub fn base_branch(pull_request: &serde_json::Value) -> Option<String> {
    pull_request
        .pointer("/base/ref")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl HostingClient for GitHubClient {
    fn kind(&self) -> HostingKind {
        HostingKind::Github
    }

    async fn fetch_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> Option<serde_json::Value> {
        match self.get_pull_request(owner, repo, number).await {
            Ok(pr) => Some(pr),
            Err(e) => {
                warn!(owner, repo, number, error = %e, "Failed to fetch pull request");
                None
            }
        }
    }

    async fn fetch_pull_request_branch(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> Option<String> {
        let pr = self.fetch_pull_request(owner, repo, number).await?;
        base_branch(&pr)
    }

    async fn push_commit_status(&self, owner: &str, repo: &str, sha: &str, status: &CommitStatus) {
        match self.post_status(owner, repo, sha, status).await {
            Ok(()) => debug!(owner, repo, sha, state = %status.state, "Pushed commit status"),
            Err(e) => warn!(owner, repo, sha, error = %e, "Failed to push commit status"),
        }
    }

    fn branch_url(&self, owner: &str, repo: &str, branch: &str) -> String {
        format!("{}/{}/{}/tree/{}", WEB_URL, owner, repo, branch)
    }

    fn pull_request_url(&self, owner: &str, repo: &str, number: &str) -> String {
        format!("{}/{}/{}/pull/{}", WEB_URL, owner, repo, number)
    }
}

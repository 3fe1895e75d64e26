//! BitBucket REST client.

use async_trait::async_trait;
use runnel_core::hosting::{CommitStatus, HostingClient};
use runnel_core::{Credentials, HostingKind};
use tracing::{debug, warn};

use crate::{HostingError, HostingResult};

pub const API_URL: &str = "https://bitbucket.org/api/2.0";
pub const WEB_URL: &str = "https://bitbucket.org";

/// BitBucket API client. Commit statuses are not supported.
pub struct BitBucketClient {
    client: reqwest::Client,
    credentials: Credentials,
    api_url: String,
}

impl BitBucketClient {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_api_url(credentials, API_URL)
    }

    pub fn with_api_url(credentials: Credentials, api_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            credentials,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> HostingResult<serde_json::Value> {
        let url = format!(
            "{}/repositories/{}/{}/pullrequests/{}",
            self.api_url, owner, repo, number
        );
        let mut request = self.client.get(&url);
        match &self.credentials {
            Credentials::Basic { username, password } => {
                request = request.basic_auth(username, Some(password));
            }
            Credentials::Token(token) => {
                request = request.bearer_auth(token);
            }
            Credentials::None => {}
        }

        let response = request.send().await?;
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
}

/// Source branch of a pull request payload.
pub fn source_branch(pull_request: &serde_json::Value) -> Option<String> {
    pull_request
        .pointer("/source/branch/name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl HostingClient for BitBucketClient {
    fn kind(&self) -> HostingKind {
        HostingKind::Bitbucket
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
        source_branch(&pr)
    }

    async fn push_commit_status(&self, owner: &str, repo: &str, sha: &str, status: &CommitStatus) {
        debug!(owner, repo, sha, state = %status.state, "Commit statuses not supported on BitBucket");
    }

    fn branch_url(&self, owner: &str, repo: &str, branch: &str) -> String {
        format!("{}/{}/{}/branch/{}", WEB_URL, owner, repo, branch)
    }

    fn pull_request_url(&self, owner: &str, repo: &str, number: &str) -> String {
        format!("{}/{}/{}/pull-request/{}", WEB_URL, owner, repo, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = BitBucketClient::new(Credentials::None);
        assert_eq!(
            client.branch_url("acme", "addons", "main"),
            "https://bitbucket.org/acme/addons/branch/main"
        );
        assert_eq!(
            client.pull_request_url("acme", "addons", "7"),
            "https://bitbucket.org/acme/addons/pull-request/7"
        );
    }

    #[test]
    fn test_source_branch() {
        let pr = serde_json::json!({
            "id": 7,
            "source": { "branch": { "name": "feature-x" } },
            "destination": { "branch": { "name": "main" } }
        });
        assert_eq!(source_branch(&pr).as_deref(), Some("feature-x"));
        assert_eq!(source_branch(&serde_json::json!({ "source": {} })), None);
    }

    #[tokio::test]
    async fn test_unreachable_api_yields_none() {
        let client = BitBucketClient::with_api_url(
            Credentials::Basic {
                username: "bot".to_string(),
                password: "pw".to_string(),
            },
            "http://127.0.0.1:9",
        );
        assert!(client.fetch_pull_request_branch("acme", "addons", "7").await.is_none());
    }
}

//! Client selection per repository.

use runnel_core::hosting::{HostingClient, HostingProvider};
use runnel_core::{HostingKind, RepoId, Repository};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Build the client matching the repository's provider.
pub fn client_for(repo: &Repository) -> Arc<dyn HostingClient> {
    match repo.hosting {
        HostingKind::Github => Arc::new(crate::GitHubClient::new(repo.credentials.clone())),
        HostingKind::Bitbucket => Arc::new(crate::BitBucketClient::new(repo.credentials.clone())),
    }
}

/// Clients of every configured repository that has credentials.
#[derive(Default)]
pub struct HostingRegistry {
    clients: HashMap<RepoId, Arc<dyn HostingClient>>,
}

impl HostingRegistry {
    pub fn new<'a>(repos: impl IntoIterator<Item = &'a Repository>) -> Self {
        let clients = repos
            .into_iter()
            .filter(|repo| !repo.credentials.is_none())
            .map(|repo| {
                debug!(repo = %repo.id, hosting = %repo.hosting, "Registered hosting client");
                (repo.id.clone(), client_for(repo))
            })
            .collect();
        Self { clients }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl HostingProvider for HostingRegistry {
    fn hosting(&self, repo: &Repository) -> Option<Arc<dyn HostingClient>> {
        self.clients.get(&repo.id).cloned()
    }

    fn links(&self, repo: &Repository) -> Arc<dyn HostingClient> {
        self.hosting(repo).unwrap_or_else(|| client_for(repo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnel_core::Credentials;

    #[test]
    fn test_client_matches_provider() {
        let github = Repository::new("https://github.com/acme/app.git", HostingKind::Github);
        let bitbucket = Repository::new("https://bitbucket.org/acme/addons.git", HostingKind::Bitbucket);
        assert_eq!(client_for(&github).kind(), HostingKind::Github);
        assert_eq!(client_for(&bitbucket).kind(), HostingKind::Bitbucket);
    }

    #[test]
    fn test_registry_skips_repos_without_credentials() {
        let mut with_token = Repository::new("https://github.com/acme/app.git", HostingKind::Github);
        with_token.credentials = Credentials::Token("secret".to_string());
        let anonymous = Repository::new("https://github.com/acme/other.git", HostingKind::Github);

        let registry = HostingRegistry::new([&with_token, &anonymous]);
        assert_eq!(registry.len(), 1);
        assert!(registry.hosting(&with_token).is_some());
        assert!(registry.hosting(&anonymous).is_none());
        assert_eq!(
            registry.links(&anonymous).branch_url("acme", "other", "main"),
            "https://github.com/acme/other/tree/main"
        );
    }
}

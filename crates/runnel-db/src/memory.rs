//! In-memory build store.

use async_trait::async_trait;
use runnel_core::{Branch, BranchId, Build, BuildId, RepoId};
use tokio::sync::RwLock;

use crate::DbResult;
use crate::snapshot::Snapshot;
use crate::store::{BuildFilter, BuildOrder, BuildPatch, BuildStore, Claim, NewBranch, NewBuild};

/// A `BuildStore` living only as long as the process. Used by tests and
/// single-shot tools; shared deployments use `FileStore` or `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn find_branch(&self, repo: &RepoId, name: &str) -> DbResult<Option<Branch>> {
        Ok(self.inner.read().await.find_branch(repo, name))
    }

    async fn create_branch(&self, branch: NewBranch) -> DbResult<Branch> {
        self.inner.write().await.create_branch(branch)
    }

    async fn get_branch(&self, id: BranchId) -> DbResult<Branch> {
        self.inner.read().await.get_branch(id)
    }

    async fn list_branches(&self, repo: &RepoId) -> DbResult<Vec<Branch>> {
        Ok(self.inner.read().await.list_branches(repo))
    }

    async fn set_branch_sticky(&self, id: BranchId, sticky: bool) -> DbResult<Branch> {
        self.inner.write().await.set_branch_sticky(id, sticky)
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        self.inner.read().await.get_build(id)
    }

    async fn search_builds(
        &self,
        filter: &BuildFilter,
        order: BuildOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> DbResult<Vec<Build>> {
        Ok(self
            .inner
            .read()
            .await
            .search_builds(filter, order, limit, offset))
    }

    async fn count_builds(&self, filter: &BuildFilter) -> DbResult<usize> {
        Ok(self.inner.read().await.count_builds(filter))
    }

    async fn create_build(&self, build: NewBuild) -> DbResult<Build> {
        self.inner.write().await.create_build(build)
    }

    async fn update_build(&self, id: BuildId, patch: BuildPatch) -> DbResult<Build> {
        self.inner.write().await.update_build(id, patch)
    }

    async fn claim_build(&self, id: BuildId, claim: Claim) -> DbResult<Option<Build>> {
        self.inner.write().await.claim_build(id, claim)
    }
}

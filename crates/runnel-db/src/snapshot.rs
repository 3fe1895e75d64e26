//! Store contents as one serializable value.
//!
//! Shared by `MemoryStore` and `FileStore`; every operation is synchronous
//! and the caller provides the locking.

use runnel_core::{Branch, BranchId, Build, BuildId, BuildState, RepoId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::store::{BuildFilter, BuildOrder, BuildPatch, Claim, NewBranch, NewBuild};
use crate::{DbError, DbResult};

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    last_branch_id: i64,
    last_build_id: i64,
    last_sequence: i64,
    branches: BTreeMap<i64, Branch>,
    builds: BTreeMap<i64, Build>,
}

impl Snapshot {
    fn branch_sticky(&self, id: BranchId) -> bool {
        self.branches.get(&id.get()).is_some_and(|b| b.sticky)
    }

    fn matching(&self, filter: &BuildFilter) -> Vec<&Build> {
        self.builds
            .values()
            .filter(|b| filter.matches(b, self.branch_sticky(b.branch)))
            .collect()
    }

    pub fn find_branch(&self, repo: &RepoId, name: &str) -> Option<Branch> {
        self.branches
            .values()
            .find(|b| &b.repo == repo && b.name == name)
            .cloned()
    }

    pub fn create_branch(&mut self, branch: NewBranch) -> DbResult<Branch> {
        if self.find_branch(&branch.repo, &branch.name).is_some() {
            return Err(DbError::Duplicate(format!(
                "branch {} of {}",
                branch.name, branch.repo
            )));
        }

        self.last_branch_id += 1;
        let record = Branch {
            id: BranchId::new(self.last_branch_id),
            repo: branch.repo,
            name: branch.name,
            sticky: branch.sticky,
        };
        self.branches.insert(record.id.get(), record.clone());
        Ok(record)
    }

    pub fn get_branch(&self, id: BranchId) -> DbResult<Branch> {
        self.branches
            .get(&id.get())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("branch {}", id)))
    }

    pub fn list_branches(&self, repo: &RepoId) -> Vec<Branch> {
        self.branches
            .values()
            .filter(|b| &b.repo == repo)
            .cloned()
            .collect()
    }

    pub fn set_branch_sticky(&mut self, id: BranchId, sticky: bool) -> DbResult<Branch> {
        let branch = self
            .branches
            .get_mut(&id.get())
            .ok_or_else(|| DbError::NotFound(format!("branch {}", id)))?;
        branch.sticky = sticky;
        Ok(branch.clone())
    }

    pub fn get_build(&self, id: BuildId) -> DbResult<Build> {
        self.builds
            .get(&id.get())
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    pub fn search_builds(
        &self,
        filter: &BuildFilter,
        order: BuildOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<Build> {
        let mut builds = self.matching(filter);
        match order {
            BuildOrder::SequenceAsc => builds.sort_by_key(|b| (b.sequence, b.id)),
            BuildOrder::SequenceDesc => {
                builds.sort_by_key(|b| std::cmp::Reverse((b.sequence, b.id)))
            }
            BuildOrder::IdDesc => builds.sort_by_key(|b| std::cmp::Reverse(b.id)),
        }
        builds
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn count_builds(&self, filter: &BuildFilter) -> usize {
        self.matching(filter).len()
    }

    pub fn create_build(&mut self, build: NewBuild) -> DbResult<Build> {
        if !self.branches.contains_key(&build.branch.get()) {
            return Err(DbError::NotFound(format!("branch {}", build.branch)));
        }

        self.last_build_id += 1;
        let sequence = match build.sequence {
            Some(sequence) => sequence,
            None => {
                self.last_sequence += 1;
                self.last_sequence
            }
        };
        let record = Build {
            id: BuildId::new(self.last_build_id),
            branch: build.branch,
            repo: build.repo,
            sha: build.sha,
            author: build.author,
            committer: build.committer,
            subject: build.subject,
            commit_date: build.commit_date,
            sequence,
            state: build.state,
            result: None,
            job: None,
            job_start: None,
            job_end: None,
            host: None,
            port: None,
            pid: None,
            link: build.link,
            modules: build.modules,
            nickname: build.nickname,
        };
        self.builds.insert(record.id.get(), record.clone());
        Ok(record)
    }

    pub fn update_build(&mut self, id: BuildId, patch: BuildPatch) -> DbResult<Build> {
        let build = self
            .builds
            .get_mut(&id.get())
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        patch.apply(build);
        Ok(build.clone())
    }

    pub fn claim_build(&mut self, id: BuildId, claim: Claim) -> DbResult<Option<Build>> {
        let port_taken = self
            .builds
            .values()
            .any(|b| b.id != id && b.state.holds_port() && b.port == Some(claim.port));
        if port_taken {
            return Ok(None);
        }

        let build = self
            .builds
            .get_mut(&id.get())
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?;
        if build.state != BuildState::Pending {
            return Ok(None);
        }

        build.state = BuildState::Testing;
        build.host = Some(claim.host);
        build.port = Some(claim.port);
        build.job = Some(claim.job);
        build.job_start = Some(claim.at);
        build.job_end = None;
        build.pid = None;
        Ok(Some(build.clone()))
    }
}

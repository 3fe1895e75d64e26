//! Build store backed by a JSON file shared between processes.

use async_trait::async_trait;
use fs2::FileExt;
use runnel_core::{Branch, BranchId, Build, BuildId, RepoId};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::snapshot::Snapshot;
use crate::store::{BuildFilter, BuildOrder, BuildPatch, BuildStore, Claim, NewBranch, NewBuild};
use crate::{DbError, DbResult};

/// A `BuildStore` kept in a single JSON file.
///
/// Every operation takes an `flock` on a sibling `.lock` file, shared for
/// reads and exclusive for writes, and reloads the file under it. Writers
/// replace the file through a temporary file renamed into place, so any
/// number of `runnel` processes on one host can share it.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStore {
    /// Use the store at `path`, creating its directory. The file itself is
    /// created by the first write.
    pub fn open(path: impl Into<PathBuf>) -> DbResult<Self> {
        let path = path.into();
        std::fs::create_dir_all(parent_dir(&path))?;
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: lock_path.into(),
        };

        // Surface a corrupt file now rather than on the first tick
        let _lock = lock(&store.lock_path, false)?;
        load(&store.path)?;
        debug!(path = %store.path.display(), "Opened build store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Snapshot) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        blocking(move || {
            let _lock = lock(&lock_path, false)?;
            f(&load(&path)?)
        })
        .await
    }

    async fn write<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Snapshot) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        blocking(move || {
            let _lock = lock(&lock_path, true)?;
            let mut snapshot = load(&path)?;
            let out = f(&mut snapshot)?;
            save(&path, &snapshot)?;
            Ok(out)
        })
        .await
    }
}

async fn blocking<T, F>(f: F) -> DbResult<T>
where
    F: FnOnce() -> DbResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DbError::Io(std::io::Error::other(e)))?
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Held until the returned file is dropped.
fn lock(lock_path: &Path, exclusive: bool) -> DbResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;
    if exclusive {
        file.lock_exclusive()?;
    } else {
        file.lock_shared()?;
    }
    Ok(file)
}

fn load(path: &Path) -> DbResult<Snapshot> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Snapshot::default()),
        Err(e) => Err(e.into()),
    }
}

fn save(path: &Path, snapshot: &Snapshot) -> DbResult<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(parent_dir(path))?;
    serde_json::to_writer(&mut tmp, snapshot)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl BuildStore for FileStore {
    async fn find_branch(&self, repo: &RepoId, name: &str) -> DbResult<Option<Branch>> {
        let repo = repo.clone();
        let name = name.to_string();
        self.read(move |s| Ok(s.find_branch(&repo, &name))).await
    }

    async fn create_branch(&self, branch: NewBranch) -> DbResult<Branch> {
        self.write(move |s| s.create_branch(branch)).await
    }

    async fn get_branch(&self, id: BranchId) -> DbResult<Branch> {
        self.read(move |s| s.get_branch(id)).await
    }

    async fn list_branches(&self, repo: &RepoId) -> DbResult<Vec<Branch>> {
        let repo = repo.clone();
        self.read(move |s| Ok(s.list_branches(&repo))).await
    }

    async fn set_branch_sticky(&self, id: BranchId, sticky: bool) -> DbResult<Branch> {
        self.write(move |s| s.set_branch_sticky(id, sticky)).await
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        self.read(move |s| s.get_build(id)).await
    }

    async fn search_builds(
        &self,
        filter: &BuildFilter,
        order: BuildOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> DbResult<Vec<Build>> {
        let filter = filter.clone();
        self.read(move |s| Ok(s.search_builds(&filter, order, limit, offset)))
            .await
    }

    async fn count_builds(&self, filter: &BuildFilter) -> DbResult<usize> {
        let filter = filter.clone();
        self.read(move |s| Ok(s.count_builds(&filter))).await
    }

    async fn create_build(&self, build: NewBuild) -> DbResult<Build> {
        self.write(move |s| s.create_build(build)).await
    }

    async fn update_build(&self, id: BuildId, patch: BuildPatch) -> DbResult<Build> {
        self.write(move |s| s.update_build(id, patch)).await
    }

    async fn claim_build(&self, id: BuildId, claim: Claim) -> DbResult<Option<Build>> {
        self.write(move |s| s.claim_build(id, claim)).await
    }
}

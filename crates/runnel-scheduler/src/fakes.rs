//! In-memory collaborators for scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use runnel_config::{PipelineConfig, ResultPatterns, Settings, StageConfig, SystemConfig};
use runnel_core::executor::{ProcessRunner, Provisioner, SpawnSpec};
use runnel_core::hosting::{CommitStatus, HostingClient, HostingProvider};
use runnel_core::source::{RefInfo, SourceControl, SourceProvider};
use runnel_core::{
    Branch, Build, BuildId, BuildState, Credentials, Dependency, Error, FixedClock, HostingKind,
    RepoId, Repository,
};
use runnel_db::{BuildStore, MemoryStore, NewBranch, NewBuild};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::Context;
use crate::context::Services;

pub const LOADED: &str =
    "2024-06-01 12:00:00,000 42 INFO db odoo.modules.loading: Modules loaded.\n";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn ref_info(name: &str, sha: &str, age_days: i64) -> RefInfo {
    RefInfo {
        name: name.to_string(),
        sha: sha.to_string(),
        commit_date: now() - Duration::days(age_days),
        author: "Ann".to_string(),
        subject: format!("commit {}", sha),
        committer: "Bob".to_string(),
    }
}

#[derive(Default)]
struct RunnerState {
    spawned: Vec<SpawnSpec>,
    locks: HashMap<i32, PathBuf>,
    held: Vec<PathBuf>,
    killed: Vec<i32>,
    fail_spawn: bool,
    reap_calls: usize,
}

/// Process runner whose "processes" hold their lock until told to finish.
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<RunnerState>,
}

impl FakeRunner {
    pub fn spawned(&self) -> Vec<SpawnSpec> {
        self.state.lock().unwrap().spawned.clone()
    }

    pub fn killed(&self) -> Vec<i32> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn reap_calls(&self) -> usize {
        self.state.lock().unwrap().reap_calls
    }

    /// Every running stage exits.
    pub fn finish_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.locks.clear();
        state.held.clear();
    }

    /// Mark a lock as held by some process not spawned here.
    pub fn hold(&self, path: PathBuf) {
        self.state.lock().unwrap().held.push(path);
    }

    pub fn fail_spawns(&self) {
        self.state.lock().unwrap().fail_spawn = true;
    }
}

impl ProcessRunner for FakeRunner {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn spawn(&self, spec: &SpawnSpec) -> runnel_core::Result<i32> {
        let mut state = self.state.lock().unwrap();
        if state.fail_spawn {
            return Err(Error::Spawn {
                command: spec.command.join(" "),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        let pid = 100 + state.spawned.len() as i32;
        state.spawned.push(spec.clone());
        state.locks.insert(pid, spec.lock_path.clone());
        Ok(pid)
    }

    fn is_locked(&self, lock_path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        state.locks.values().any(|p| p == lock_path) || state.held.iter().any(|p| p == lock_path)
    }

    fn kill_group(&self, pid: i32) -> runnel_core::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(pid);
        if let Some(path) = state.locks.remove(&pid) {
            state.held.retain(|p| p != &path);
        }
        Ok(())
    }

    fn reap(&self) -> usize {
        self.state.lock().unwrap().reap_calls += 1;
        0
    }
}

#[derive(Default)]
struct SourceState {
    refs: Vec<RefInfo>,
    fetches: Vec<Vec<String>>,
    exports: Vec<String>,
    merge_bases: HashMap<(String, String), String>,
    dates: HashMap<String, DateTime<Utc>>,
    fail_listing: bool,
    fail_exports: bool,
}

#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn set_refs(&self, refs: Vec<RefInfo>) {
        self.state.lock().unwrap().refs = refs;
    }

    pub fn set_merge_base(&self, a: &str, b: &str, sha: &str) {
        self.state
            .lock()
            .unwrap()
            .merge_bases
            .insert((a.to_string(), b.to_string()), sha.to_string());
    }

    pub fn set_date(&self, sha: &str, date: DateTime<Utc>) {
        self.state.lock().unwrap().dates.insert(sha.to_string(), date);
    }

    pub fn fail_listing(&self) {
        self.state.lock().unwrap().fail_listing = true;
    }

    pub fn fail_exports(&self) {
        self.state.lock().unwrap().fail_exports = true;
    }

    pub fn fetches(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub fn exports(&self) -> Vec<String> {
        self.state.lock().unwrap().exports.clone()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn fetch(&self, refspecs: &[String]) -> runnel_core::Result<()> {
        self.state.lock().unwrap().fetches.push(refspecs.to_vec());
        Ok(())
    }

    async fn for_each_ref(&self) -> runnel_core::Result<Vec<RefInfo>> {
        let state = self.state.lock().unwrap();
        if state.fail_listing {
            return Err(Error::SourceControl("for-each-ref failed".to_string()));
        }
        Ok(state.refs.clone())
    }

    async fn export(&self, treeish: &str, _dest: &Path) -> runnel_core::Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_exports {
            return Err(Error::SourceControl(format!("unknown revision {}", treeish)));
        }
        state.exports.push(treeish.to_string());
        Ok(())
    }

    async fn merge_base(&self, a: &str, b: &str) -> runnel_core::Result<String> {
        self.state
            .lock()
            .unwrap()
            .merge_bases
            .get(&(a.to_string(), b.to_string()))
            .cloned()
            .ok_or_else(|| Error::SourceControl(format!("no merge base for {} {}", a, b)))
    }

    async fn log_one(&self, sha: &str) -> runnel_core::Result<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap()
            .dates
            .get(sha)
            .copied()
            .ok_or_else(|| Error::SourceControl(format!("unknown commit {}", sha)))
    }
}

#[derive(Default)]
pub struct FakeSources {
    sources: Mutex<HashMap<RepoId, Arc<FakeSource>>>,
}

impl FakeSources {
    pub fn get(&self, repo: &RepoId) -> Arc<FakeSource> {
        self.sources
            .lock()
            .unwrap()
            .entry(repo.clone())
            .or_default()
            .clone()
    }
}

impl SourceProvider for FakeSources {
    fn source(&self, repo: &Repository) -> Arc<dyn SourceControl> {
        self.get(&repo.id)
    }
}

#[derive(Debug, Clone)]
pub struct Push {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub status: CommitStatus,
}

#[derive(Default)]
pub struct FakeHosting {
    pushes: Mutex<Vec<Push>>,
    pull_request_branches: Mutex<HashMap<String, String>>,
    pull_request_lookups: Mutex<usize>,
}

impl FakeHosting {
    pub fn pushes(&self) -> Vec<Push> {
        self.pushes.lock().unwrap().clone()
    }

    pub fn pull_request_lookups(&self) -> usize {
        *self.pull_request_lookups.lock().unwrap()
    }

    pub fn set_pull_request_branch(&self, number: &str, branch: &str) {
        self.pull_request_branches
            .lock()
            .unwrap()
            .insert(number.to_string(), branch.to_string());
    }
}

#[async_trait]
impl HostingClient for FakeHosting {
    fn kind(&self) -> HostingKind {
        HostingKind::Github
    }

    async fn fetch_pull_request(
        &self,
        _owner: &str,
        _repo: &str,
        number: &str,
    ) -> Option<serde_json::Value> {
        *self.pull_request_lookups.lock().unwrap() += 1;
        let branch = self.pull_request_branches.lock().unwrap().get(number).cloned()?;
        Some(serde_json::json!({
            "number": number,
            "title": format!("Pull request {}", number),
            "base": { "ref": branch },
        }))
    }

    async fn fetch_pull_request_branch(
        &self,
        owner: &str,
        repo: &str,
        number: &str,
    ) -> Option<String> {
        let pr = self.fetch_pull_request(owner, repo, number).await?;
        pr.pointer("/base/ref")?.as_str().map(str::to_string)
    }

    async fn push_commit_status(&self, owner: &str, repo: &str, sha: &str, status: &CommitStatus) {
        self.pushes.lock().unwrap().push(Push {
            owner: owner.to_string(),
            repo: repo.to_string(),
            sha: sha.to_string(),
            status: status.clone(),
        });
    }

    fn branch_url(&self, owner: &str, repo: &str, branch: &str) -> String {
        format!("https://example.com/{}/{}/tree/{}", owner, repo, branch)
    }

    fn pull_request_url(&self, owner: &str, repo: &str, number: &str) -> String {
        format!("https://example.com/{}/{}/pull/{}", owner, repo, number)
    }
}

/// Hands the shared fake client to repositories with credentials.
pub struct FakeHostingProvider {
    client: Arc<FakeHosting>,
}

impl HostingProvider for FakeHostingProvider {
    fn hosting(&self, repo: &Repository) -> Option<Arc<dyn HostingClient>> {
        if repo.credentials.is_none() {
            return None;
        }
        Some(self.client.clone())
    }

    fn links(&self, _repo: &Repository) -> Arc<dyn HostingClient> {
        self.client.clone()
    }
}

#[derive(Default)]
pub struct FakeProvisioner {
    created: Mutex<Vec<String>>,
    dropped: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn create_database(&self, name: &str) -> runnel_core::Result<()> {
        self.created.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> runnel_core::Result<()> {
        self.dropped.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

fn stage(name: &str, cpu_limit: Option<u64>, database: &str, capture_stderr: bool) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        command: vec![
            "./server".to_string(),
            "--port=${build.port}".to_string(),
            "-d".to_string(),
            "${build.db}".to_string(),
        ],
        cpu_limit,
        database: Some(database.to_string()),
        capture_stderr,
        env: HashMap::new(),
    }
}

/// A context over fakes, with four repositories:
/// - `app`: GitHub with a token, sticky `main`, a flat dependency on
///   `addons` and a nested one on `tools`
/// - `dev`: GitHub with a token, deduplicated against `app`
/// - `addons`, `tools`: no credentials
pub struct Harness {
    pub ctx: Context,
    pub runner: Arc<FakeRunner>,
    pub sources: Arc<FakeSources>,
    pub hosting: Arc<FakeHosting>,
    pub provisioner: Arc<FakeProvisioner>,
    pub clock: Arc<FixedClock>,
    pub app: Repository,
    pub dev: Repository,
    pub addons: Repository,
    pub tools: Repository,
    _root: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();

        let addons = Repository::new("https://github.com/acme/addons.git", HostingKind::Github);
        let tools = Repository::new("https://github.com/acme/tools.git", HostingKind::Github);
        let mut app = Repository::new("https://github.com/acme/app.git", HostingKind::Github);
        app.credentials = Credentials::Token("t".to_string());
        app.sticky = vec!["main".to_string()];
        app.modules = Some("base,web".to_string());
        app.dependencies = vec![
            Dependency::Flat(addons.id.clone()),
            Dependency::Nested {
                repo: tools.id.clone(),
                reference: "refs/heads/stable".to_string(),
            },
        ];
        let mut dev = Repository::new("https://github.com/acme-dev/app.git", HostingKind::Github);
        dev.credentials = Credentials::Token("t".to_string());
        dev.dedup_target = Some(app.id.clone());

        let settings = Settings {
            host: Some("ci-1".to_string()),
            root: root.path().to_path_buf(),
            domain: Some("runbot.example.com".to_string()),
            ..Settings::default()
        };
        let pipeline = PipelineConfig {
            stages: vec![
                stage("test_base", Some(300), "base", false),
                stage("test_all", Some(2100), "all", false),
                stage("run", None, "all", true),
            ],
            result: ResultPatterns::default(),
        };
        let config = SystemConfig {
            settings,
            pipeline,
            repositories: vec![app.clone(), dev.clone(), addons.clone(), tools.clone()],
        };

        let runner = Arc::new(FakeRunner::default());
        let sources = Arc::new(FakeSources::default());
        let hosting = Arc::new(FakeHosting::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        let clock = Arc::new(FixedClock::new(now()));
        let ctx = Context::new(
            config,
            "ci-1",
            Services {
                store: Arc::new(MemoryStore::new()),
                runner: runner.clone(),
                provisioner: provisioner.clone(),
                sources: sources.clone(),
                hosting: Arc::new(FakeHostingProvider {
                    client: hosting.clone(),
                }),
                clock: clock.clone(),
            },
        );

        Self {
            ctx,
            runner,
            sources,
            hosting,
            provisioner,
            clock,
            app,
            dev,
            addons,
            tools,
            _root: root,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.ctx.now()
    }

    pub fn source(&self, repo: &Repository) -> Arc<FakeSource> {
        self.sources.get(&repo.id)
    }

    pub async fn branch(&self, repo: &Repository, name: &str) -> Branch {
        if let Some(branch) = self.ctx.store.find_branch(&repo.id, name).await.unwrap() {
            return branch;
        }
        let short = runnel_core::build::short_name(name);
        self.ctx
            .store
            .create_branch(NewBranch {
                repo: repo.id.clone(),
                name: name.to_string(),
                sticky: repo.is_sticky_branch(short),
            })
            .await
            .unwrap()
    }

    pub fn new_build(&self, branch: &Branch, sha: &str) -> NewBuild {
        NewBuild {
            branch: branch.id,
            repo: branch.repo.clone(),
            sha: sha.to_string(),
            author: "Ann".to_string(),
            committer: "Bob".to_string(),
            subject: format!("commit {}", sha),
            commit_date: Some(now()),
            state: BuildState::Pending,
            link: None,
            modules: Some("base,web".to_string()),
            nickname: branch.nickname(),
            sequence: None,
        }
    }

    /// A pending build stored on `branch`.
    pub async fn build_on(&self, branch: &Branch, sha: &str) -> Build {
        self.ctx
            .store
            .create_build(self.new_build(branch, sha))
            .await
            .unwrap()
    }

    /// A build record that is not in the store.
    pub fn sample_build(&self) -> Build {
        Build {
            id: BuildId::new(1),
            branch: runnel_core::BranchId::new(1),
            repo: self.app.id.clone(),
            sha: "abcdef123456".to_string(),
            author: "Ann".to_string(),
            committer: "Bob".to_string(),
            subject: "fix".to_string(),
            commit_date: Some(now()),
            sequence: 1,
            state: BuildState::Pending,
            result: None,
            job: None,
            job_start: None,
            job_end: None,
            host: None,
            port: None,
            pid: None,
            link: None,
            modules: None,
            nickname: "feature-x".to_string(),
        }
    }
}

//! PostgreSQL implementation of the build store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runnel_core::{Branch, BranchId, Build, BuildId, BuildLink, BuildResult, BuildState, RepoId};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use crate::store::{BuildFilter, BuildOrder, BuildPatch, BuildStore, Claim, NewBranch, NewBuild};
use crate::{DbError, DbResult};

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// A branch row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BranchRecord {
    pub id: i64,
    pub repo: String,
    pub name: String,
    pub sticky: bool,
}

impl From<BranchRecord> for Branch {
    fn from(r: BranchRecord) -> Self {
        Branch {
            id: BranchId::new(r.id),
            repo: RepoId::new(r.repo),
            name: r.name,
            sticky: r.sticky,
        }
    }
}

/// A build row. The link is split over `link_kind` and `link_id`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BuildRecord {
    pub id: i64,
    pub branch_id: i64,
    pub repo: String,
    pub sha: String,
    pub author: String,
    pub committer: String,
    pub subject: String,
    pub commit_date: Option<DateTime<Utc>>,
    pub sequence: i64,
    pub state: String,
    pub result: Option<String>,
    pub job: Option<String>,
    pub job_start: Option<DateTime<Utc>>,
    pub job_end: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub pid: Option<i32>,
    pub link_kind: Option<String>,
    pub link_id: Option<i64>,
    pub modules: Option<String>,
    pub nickname: String,
}

impl TryFrom<BuildRecord> for Build {
    type Error = DbError;

    fn try_from(r: BuildRecord) -> DbResult<Self> {
        let corrupt = |what: String| DbError::Corrupt(format!("build {}: {}", r.id, what));
        let state = r.state.parse::<BuildState>().map_err(corrupt)?;
        let result = r
            .result
            .as_deref()
            .map(str::parse::<BuildResult>)
            .transpose()
            .map_err(corrupt)?;
        let port = r
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|e| corrupt(format!("port: {}", e)))?;
        let link = match (r.link_kind.as_deref(), r.link_id) {
            (None, _) => None,
            (Some("mirrors"), Some(id)) => Some(BuildLink::Mirrors(BuildId::new(id))),
            (Some("forwards"), Some(id)) => Some(BuildLink::Forwards(BuildId::new(id))),
            (Some(kind), _) => return Err(corrupt(format!("link {}", kind))),
        };

        Ok(Build {
            id: BuildId::new(r.id),
            branch: BranchId::new(r.branch_id),
            repo: RepoId::new(r.repo),
            sha: r.sha,
            author: r.author,
            committer: r.committer,
            subject: r.subject,
            commit_date: r.commit_date,
            sequence: r.sequence,
            state,
            result,
            job: r.job,
            job_start: r.job_start,
            job_end: r.job_end,
            host: r.host,
            port,
            pid: r.pid,
            link,
            modules: r.modules,
            nickname: r.nickname,
        })
    }
}

fn link_columns(link: Option<BuildLink>) -> (Option<&'static str>, Option<i64>) {
    match link {
        None => (None, None),
        Some(BuildLink::Mirrors(id)) => (Some("mirrors"), Some(id.get())),
        Some(BuildLink::Forwards(id)) => (Some("forwards"), Some(id.get())),
    }
}

const SELECT_BUILDS: &str = "SELECT b.* FROM builds b JOIN branches br ON br.id = b.branch_id";
const COUNT_BUILDS: &str = "SELECT COUNT(*) FROM builds b JOIN branches br ON br.id = b.branch_id";

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &BuildFilter) {
    qb.push(" WHERE TRUE");
    if let Some(repos) = &filter.repos {
        let repos: Vec<String> = repos.iter().map(|r| r.as_str().to_string()).collect();
        qb.push(" AND b.repo = ANY(").push_bind(repos).push(")");
    }
    if let Some(branch) = filter.branch {
        qb.push(" AND b.branch_id = ").push_bind(branch.get());
    }
    if let Some(sha) = &filter.sha {
        qb.push(" AND b.sha = ").push_bind(sha.clone());
    }
    if let Some(states) = &filter.states {
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        qb.push(" AND b.state = ANY(").push_bind(states).push(")");
    }
    if let Some(host) = &filter.host {
        qb.push(" AND b.host = ").push_bind(host.clone());
    }
    if let Some(sticky) = filter.sticky {
        qb.push(" AND br.sticky = ").push_bind(sticky);
    }
    if filter.unlinked {
        qb.push(" AND b.link_kind IS NULL");
    }
    if filter.not_skipped {
        qb.push(" AND b.result IS DISTINCT FROM 'skipped'");
    }
    if let Some(id) = filter.exclude {
        qb.push(" AND b.id <> ").push_bind(id.get());
    }
}

fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: BuildOrder) {
    qb.push(match order {
        BuildOrder::SequenceAsc => " ORDER BY b.sequence ASC, b.id ASC",
        BuildOrder::SequenceDesc => " ORDER BY b.sequence DESC, b.id DESC",
        BuildOrder::IdDesc => " ORDER BY b.id DESC",
    });
}

/// `UPDATE builds SET … WHERE id = $n RETURNING *`, or `None` for an empty
/// patch.
fn update_query(id: BuildId, patch: BuildPatch) -> Option<QueryBuilder<'static, Postgres>> {
    let mut qb = QueryBuilder::new("UPDATE builds SET ");
    let mut fields = 0;
    {
        let mut set = qb.separated(", ");
        if let Some(state) = patch.state {
            set.push("state = ").push_bind_unseparated(state.to_string());
            fields += 1;
        }
        if let Some(result) = patch.result {
            set.push("result = ")
                .push_bind_unseparated(result.map(|r| r.to_string()));
            fields += 1;
        }
        if let Some(job) = patch.job {
            set.push("job = ").push_bind_unseparated(job);
            fields += 1;
        }
        if let Some(at) = patch.job_start {
            set.push("job_start = ").push_bind_unseparated(at);
            fields += 1;
        }
        if let Some(at) = patch.job_end {
            set.push("job_end = ").push_bind_unseparated(at);
            fields += 1;
        }
        if let Some(host) = patch.host {
            set.push("host = ").push_bind_unseparated(host);
            fields += 1;
        }
        if let Some(port) = patch.port {
            set.push("port = ")
                .push_bind_unseparated(port.map(i32::from));
            fields += 1;
        }
        if let Some(pid) = patch.pid {
            set.push("pid = ").push_bind_unseparated(pid);
            fields += 1;
        }
        if let Some(link) = patch.link {
            let (kind, target) = link_columns(link);
            set.push("link_kind = ").push_bind_unseparated(kind);
            set.push("link_id = ").push_bind_unseparated(target);
            fields += 1;
        }
        if let Some(sequence) = patch.sequence {
            set.push("sequence = ").push_bind_unseparated(sequence);
            fields += 1;
        }
    }
    if fields == 0 {
        return None;
    }
    qb.push(" WHERE id = ").push_bind(id.get()).push(" RETURNING *");
    Some(qb)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

/// PostgreSQL implementation of BuildStore.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn find_branch(&self, repo: &RepoId, name: &str) -> DbResult<Option<Branch>> {
        let record = sqlx::query_as::<_, BranchRecord>(
            "SELECT * FROM branches WHERE repo = $1 AND name = $2",
        )
        .bind(repo.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Branch::from))
    }

    async fn create_branch(&self, branch: NewBranch) -> DbResult<Branch> {
        let record = sqlx::query_as::<_, BranchRecord>(
            r#"
            INSERT INTO branches (repo, name, sticky)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(branch.repo.as_str())
        .bind(&branch.name)
        .bind(branch.sticky)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::Duplicate(format!("branch {} of {}", branch.name, branch.repo))
            } else {
                e.into()
            }
        })?;
        Ok(record.into())
    }

    async fn get_branch(&self, id: BranchId) -> DbResult<Branch> {
        let record = sqlx::query_as::<_, BranchRecord>("SELECT * FROM branches WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("branch {}", id)))?;
        Ok(record.into())
    }

    async fn list_branches(&self, repo: &RepoId) -> DbResult<Vec<Branch>> {
        let records = sqlx::query_as::<_, BranchRecord>(
            "SELECT * FROM branches WHERE repo = $1 ORDER BY id",
        )
        .bind(repo.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(records.into_iter().map(Branch::from).collect())
    }

    async fn set_branch_sticky(&self, id: BranchId, sticky: bool) -> DbResult<Branch> {
        let record = sqlx::query_as::<_, BranchRecord>(
            "UPDATE branches SET sticky = $2 WHERE id = $1 RETURNING *",
        )
        .bind(id.get())
        .bind(sticky)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("branch {}", id)))?;
        Ok(record.into())
    }

    async fn get_build(&self, id: BuildId) -> DbResult<Build> {
        sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?
            .try_into()
    }

    async fn search_builds(
        &self,
        filter: &BuildFilter,
        order: BuildOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> DbResult<Vec<Build>> {
        let mut qb = QueryBuilder::new(SELECT_BUILDS);
        push_filter(&mut qb, filter);
        push_order(&mut qb, order);
        if let Some(limit) = limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if offset > 0 {
            qb.push(" OFFSET ").push_bind(offset as i64);
        }
        qb.build_query_as::<BuildRecord>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Build::try_from)
            .collect()
    }

    async fn count_builds(&self, filter: &BuildFilter) -> DbResult<usize> {
        let mut qb = QueryBuilder::new(COUNT_BUILDS);
        push_filter(&mut qb, filter);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as usize)
    }

    async fn create_build(&self, build: NewBuild) -> DbResult<Build> {
        let (link_kind, link_id) = link_columns(build.link);
        sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (branch_id, repo, sha, author, committer, subject, commit_date,
                                sequence, state, link_kind, link_id, modules, nickname)
            VALUES ($1, $2, $3, $4, $5, $6, $7,
                    COALESCE($8, nextval('build_sequence')), $9, $10, $11, $12, $13)
            RETURNING *
            "#,
        )
        .bind(build.branch.get())
        .bind(build.repo.as_str())
        .bind(&build.sha)
        .bind(&build.author)
        .bind(&build.committer)
        .bind(&build.subject)
        .bind(build.commit_date)
        .bind(build.sequence)
        .bind(build.state.to_string())
        .bind(link_kind)
        .bind(link_id)
        .bind(&build.modules)
        .bind(&build.nickname)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                DbError::NotFound(format!("branch {}", build.branch))
            } else {
                e.into()
            }
        })?
        .try_into()
    }

    async fn update_build(&self, id: BuildId, patch: BuildPatch) -> DbResult<Build> {
        let Some(mut qb) = update_query(id, patch) else {
            return self.get_build(id).await;
        };
        qb.build_query_as::<BuildRecord>()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))?
            .try_into()
    }

    async fn claim_build(&self, id: BuildId, claim: Claim) -> DbResult<Option<Build>> {
        let claimed = sqlx::query_as::<_, BuildRecord>(
            r#"
            UPDATE builds
            SET state = 'testing', host = $2, port = $3, job = $4,
                job_start = $5, job_end = NULL, pid = NULL
            WHERE id = $1 AND state = 'pending'
              AND NOT EXISTS (
                  SELECT 1 FROM builds held
                  WHERE held.id <> $1 AND held.port = $3
                    AND held.state IN ('testing', 'running', 'duplicate')
              )
            RETURNING *
            "#,
        )
        .bind(id.get())
        .bind(&claim.host)
        .bind(i32::from(claim.port))
        .bind(&claim.job)
        .bind(claim.at)
        .fetch_optional(&self.pool)
        .await;

        match claimed {
            Ok(Some(record)) => Ok(Some(record.try_into()?)),
            // Another writer took the port between the check and the update
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
            Ok(None) => {
                self.get_build(id).await?;
                Ok(None)
            }
        }
    }
}

//! Per-build stage state machine.
//!
//! A build walks the configured stages in order. Every stage runs as a
//! detached process holding `logs/<stage>.lock`; the lock being free again
//! is the only completion signal. Finishing the last test stage evaluates
//! the result and moves the build to `running`, where the serve stage keeps
//! it reachable until it exits or is evicted.

use runnel_config::VariableContextBuilder;
use runnel_core::executor::SpawnSpec;
use runnel_core::{Build, BuildResult, BuildState};
use runnel_db::BuildPatch;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::{Context, Result, SchedulerError, result, status};

/// Outcome of polling an in-flight build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Current stage still holds its lock.
    Waiting,
    /// Moved on to the next stage.
    Advanced,
    /// Serve stage exited; the build is done.
    Finished,
    /// Killed for exceeding the stage timeout.
    TimedOut,
}

pub struct JobPipeline<'a> {
    ctx: &'a Context,
}

impl<'a> JobPipeline<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self { ctx }
    }

    /// Run the first stage of a freshly claimed build.
    pub async fn start(&self, build: Build) -> Result<Build> {
        info!(build_id = %build.id, port = ?build.port, "Starting build");
        status::push(self.ctx, &build).await;
        self.run_stage(build).await
    }

    /// Check the current stage of an in-flight build and move it along.
    pub async fn advance(&self, build: &Build) -> Result<Advance> {
        let ctx = self.ctx;
        let pipeline = &ctx.pipeline;
        let Some(job) = build.job.clone() else {
            warn!(build_id = %build.id, state = %build.state, "In-flight build without a stage");
            return Ok(Advance::Waiting);
        };
        let now = ctx.now();

        if !pipeline.is_last(&job) && build.job_time(now) > ctx.settings.stage_timeout_secs {
            warn!(
                build_id = %build.id,
                stage = %job,
                elapsed = build.job_time(now),
                "Stage timed out"
            );
            self.kill(build).await?;
            return Ok(Advance::TimedOut);
        }

        let ws = ctx.workspace(build);
        if ctx.runner.is_locked(&ws.lock_path(&job)) {
            return Ok(Advance::Waiting);
        }

        if pipeline.is_last(&job) {
            ctx.store
                .update_build(
                    build.id,
                    BuildPatch::new()
                        .state(BuildState::Done)
                        .job(None)
                        .port(None)
                        .pid(None),
                )
                .await?;
            info!(build_id = %build.id, "Build finished");
            return Ok(Advance::Finished);
        }

        if pipeline.is_last_test(&job) {
            let outcome = result::evaluate_log(&pipeline.result, &ws.log_path(&job)).await;
            let serve = pipeline.last().name.clone();
            let build = ctx
                .store
                .update_build(
                    build.id,
                    BuildPatch::new()
                        .state(BuildState::Running)
                        .result(Some(outcome))
                        .job(Some(serve))
                        .job_end(Some(now))
                        .pid(None),
                )
                .await?;
            info!(build_id = %build.id, result = %outcome, "Tests finished");
            status::push(ctx, &build).await;
            self.run_stage(build).await?;
            return Ok(Advance::Advanced);
        }

        let next = pipeline
            .next_after(&job)
            .ok_or_else(|| SchedulerError::UnknownStage(job.clone()))?
            .name
            .clone();
        let build = ctx
            .store
            .update_build(
                build.id,
                BuildPatch::new()
                    .job(Some(next))
                    .job_start(Some(now))
                    .pid(None),
            )
            .await?;
        self.run_stage(build).await?;
        Ok(Advance::Advanced)
    }

    /// Spawn the build's current stage and record its pid.
    ///
    /// Failing to prepare or spawn the stage ends the build as `ko`.
    async fn run_stage(&self, build: Build) -> Result<Build> {
        let job = build.job.clone().unwrap_or_default();
        match self.spawn_stage(&build, &job).await {
            Ok(pid) => {
                info!(build_id = %build.id, stage = %job, pid, "Spawned stage");
                Ok(self
                    .ctx
                    .store
                    .update_build(build.id, BuildPatch::new().pid(Some(pid)))
                    .await?)
            }
            Err(e) => {
                error!(build_id = %build.id, stage = %job, error = %e, "Stage failed to start");
                self.fail(&build).await
            }
        }
    }

    async fn spawn_stage(&self, build: &Build, job: &str) -> Result<i32> {
        let ctx = self.ctx;
        let pipeline = &ctx.pipeline;
        let index = pipeline
            .index_of(job)
            .ok_or_else(|| SchedulerError::UnknownStage(job.to_string()))?;
        let stage = &pipeline.stages[index];
        let ws = ctx.workspace(build);
        let branch = ctx.store.get_branch(build.branch).await?;

        if index == 0 {
            ws.reset().await?;
            ws.checkout(ctx, build, &branch).await?;
        } else {
            tokio::fs::create_dir_all(ws.logs_dir()).await?;
        }

        let database = stage
            .database
            .as_ref()
            .map(|suffix| format!("{}-{}", build.dest(), suffix));
        // Later stages reuse a database an earlier stage created
        let fresh = pipeline.stages[..index]
            .iter()
            .all(|s| s.database != stage.database);
        if let (Some(db), true) = (&database, fresh) {
            ctx.provisioner.create_database(db).await?;
        }

        let mut vars = VariableContextBuilder::new()
            .with_git_sha(build.sha.clone())
            .with_git_ref(branch.name.clone())
            .with_build(
                build.id.to_string(),
                build.dest(),
                ws.path().display().to_string(),
            )
            .with_port(build.port)
            .with_database(database)
            .with_modules(build.modules.clone().unwrap_or_default())
            .with_stage(stage.name.clone(), index);
        for (key, value) in std::env::vars() {
            vars = vars.with_env(key, value);
        }
        let vars = vars.build();

        let spec = SpawnSpec {
            command: vars.interpolate_vec(&stage.command),
            working_dir: Some(ws.path().to_path_buf()),
            env: vars.interpolate_map(&stage.env),
            lock_path: ws.lock_path(&stage.name),
            log_path: ws.log_path(&stage.name),
            cpu_limit: stage.cpu_limit.map(Duration::from_secs),
            capture_stderr: stage.capture_stderr,
        };
        Ok(ctx.runner.spawn(&spec)?)
    }

    async fn fail(&self, build: &Build) -> Result<Build> {
        let ctx = self.ctx;
        let build = ctx
            .store
            .update_build(
                build.id,
                BuildPatch::new()
                    .state(BuildState::Done)
                    .result(Some(BuildResult::Ko))
                    .job(None)
                    .job_end(Some(ctx.now()))
                    .port(None)
                    .pid(None),
            )
            .await?;
        self.drop_databases(&build).await;
        status::push(ctx, &build).await;
        Ok(build)
    }

    /// Kill the build's process group and release everything it holds.
    pub async fn terminate(&self, build: &Build) -> Result<Build> {
        let ctx = self.ctx;
        if let Some(pid) = build.pid {
            if let Err(e) = ctx.runner.kill_group(pid) {
                warn!(build_id = %build.id, pid, error = %e, "Failed to kill process group");
            }
        }
        let build = ctx
            .store
            .update_build(
                build.id,
                BuildPatch::new()
                    .state(BuildState::Done)
                    .job(None)
                    .port(None)
                    .pid(None),
            )
            .await?;
        self.drop_databases(&build).await;
        if let Err(e) = ctx.workspace(&build).remove().await {
            warn!(build_id = %build.id, error = %e, "Failed to remove workspace");
        }
        info!(build_id = %build.id, "Terminated build");
        Ok(build)
    }

    /// Terminate and record the build as killed.
    pub async fn kill(&self, build: &Build) -> Result<Build> {
        self.terminate(build).await?;
        let build = self
            .ctx
            .store
            .update_build(
                build.id,
                BuildPatch::new().result(Some(BuildResult::Killed)),
            )
            .await?;
        info!(build_id = %build.id, "Killed build");
        status::push(self.ctx, &build).await;
        Ok(build)
    }

    async fn drop_databases(&self, build: &Build) {
        for suffix in self.ctx.pipeline.database_suffixes() {
            let name = format!("{}-{}", build.dest(), suffix);
            if let Err(e) = self.ctx.provisioner.drop_database(&name).await {
                warn!(build_id = %build.id, database = %name, error = %e, "Failed to drop database");
            }
        }
    }
}

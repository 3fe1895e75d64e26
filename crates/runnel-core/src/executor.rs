//! Process runner and provisioner traits.
//!
//! Stage processes outlive the scheduler tick that spawned them. The runner
//! hands each one an advisory lock file that the child holds until it exits,
//! and later ticks probe that lock to learn whether the stage is finished.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Specification for a stage process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Lock held by the child for its whole lifetime.
    pub lock_path: PathBuf,
    /// Receives stdout, and stderr when `capture_stderr` is set.
    pub log_path: PathBuf,
    /// Soft CPU time budget on top of what the child already consumed.
    pub cpu_limit: Option<Duration>,
    pub capture_stderr: bool,
}

/// Spawns detached stage processes and inspects them from later ticks.
pub trait ProcessRunner: Send + Sync {
    /// Name of this runner.
    fn name(&self) -> &'static str;

    /// Start the process in a new process group and return its pid.
    fn spawn(&self, spec: &SpawnSpec) -> Result<i32>;

    /// Whether some process still holds the lock at `lock_path`.
    fn is_locked(&self, lock_path: &Path) -> bool;

    /// Kill the whole process group led by `pid`.
    fn kill_group(&self, pid: i32) -> Result<()>;

    /// Collect every exited child without blocking; returns how many.
    fn reap(&self) -> usize;
}

/// Creates and drops the ephemeral databases of a build.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Drop `name` if present, then create it empty.
    async fn create_database(&self, name: &str) -> Result<()>;

    async fn drop_database(&self, name: &str) -> Result<()>;
}

//! Build scheduling for runnel.
//!
//! Watches repositories for new commits and drives each build through the
//! configured stage pipeline:
//! - `RefSyncer` turns refs into branch and build records
//! - `dedup` links builds of paired repositories
//! - `JobPipeline` advances one build from stage to stage
//! - `Scheduler` admits, evicts and reaps under the slot budgets
//!
//! All coordination goes through the build store; nothing survives a tick
//! in memory.

pub mod branches;
pub mod context;
pub mod dedup;
pub mod error;
pub mod pipeline;
pub mod ports;
pub mod rebuild;
pub mod result;
pub mod scheduler;
pub mod status;
pub mod sync;
pub mod workspace;

#[cfg(test)]
pub(crate) mod fakes;

pub use branches::{PullInfo, branch_url, pull_info};
pub use context::{Context, Services};
pub use error::{Result, SchedulerError};
pub use pipeline::{Advance, JobPipeline};
pub use rebuild::{force_rebuild, skip};
pub use scheduler::{Scheduler, TickReport};
pub use sync::{RefSyncer, SyncReport};
pub use workspace::Workspace;

//! Scheduler error types.

use runnel_core::{BuildId, BuildState, RepoId};
use runnel_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("source control error: {0}")]
    Source(#[source] runnel_core::Error),

    #[error(transparent)]
    Core(#[from] runnel_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not configured: {0}")]
    UnknownRepository(RepoId),

    #[error("stage not in pipeline: {0}")]
    UnknownStage(String),

    #[error("no free port from {0}")]
    PortsExhausted(u16),

    #[error("build {id} is {state}: {message}")]
    InvalidState {
        id: BuildId,
        state: BuildState,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

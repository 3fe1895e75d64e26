//! Hosting API errors.
//!
//! These never leave the clients: callers of `HostingClient` only see
//! degraded results, and the errors end up in the logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostingError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("unexpected payload: {0}")]
    Parse(String),
}

pub type HostingResult<T> = std::result::Result<T, HostingError>;

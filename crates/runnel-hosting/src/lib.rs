//! Hosting provider clients for runnel.
//!
//! Each watched repository gets a client for its provider, chosen once from
//! the repository's `hosting` field:
//! - `GitHubClient` - pull requests and commit statuses
//! - `BitBucketClient` - pull requests only; status pushes are dropped

pub mod bitbucket;
pub mod error;
pub mod github;
pub mod registry;

pub use bitbucket::BitBucketClient;
pub use error::{HostingError, HostingResult};
pub use github::GitHubClient;
pub use registry::{HostingRegistry, client_for};

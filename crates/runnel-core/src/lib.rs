//! Core domain types and traits for the runnel CI orchestrator.
//!
//! This crate contains:
//! - Identifiers for repositories, branches and builds
//! - Repository, branch and build records with their state machines
//! - The process runner and provisioner traits used to drive stages
//! - The hosting client trait for commit statuses and pull requests
//! - The source control trait for ref listing and exports

pub mod build;
pub mod clock;
pub mod error;
pub mod executor;
pub mod hosting;
pub mod id;
pub mod repository;
pub mod source;

pub use build::{Branch, Build, BuildLink, BuildResult, BuildState};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, Result};
pub use id::{BranchId, BuildId, RepoId};
pub use repository::{Credentials, Dependency, HostingKind, RepoBase, Repository};

//! Process, source control and database backends for runnel.
//!
//! Provides implementations of the core collaborator traits:
//! - `LocalProcessRunner` - detached stage processes with lock files
//! - `GitCli` - bare clone plumbing through the `git` binary
//! - `PostgresProvisioner` - ephemeral databases through `createdb`/`dropdb`

pub mod git;
pub mod process;
pub mod provision;

pub use git::{GitCli, GitProvider};
pub use process::LocalProcessRunner;
pub use provision::PostgresProvisioner;

pub use runnel_core::executor::{ProcessRunner, Provisioner, SpawnSpec};

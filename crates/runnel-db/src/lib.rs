//! Store layer for the runnel CI orchestrator.
//!
//! Provides the `BuildStore` trait with three implementations: PostgreSQL
//! for shared deployments, a locked JSON file for single-host setups and an
//! in-memory store for tests.

pub mod error;
pub mod file;
pub mod memory;
pub mod postgres;
mod snapshot;
pub mod store;

pub use error::{DbError, DbResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use postgres::{PgStore, create_pool, run_migrations};
pub use store::{BuildFilter, BuildOrder, BuildPatch, BuildStore, Claim, NewBranch, NewBuild};

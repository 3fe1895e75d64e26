//! KDL configuration parsing for the runnel CI orchestrator.
//!
//! This crate handles parsing of:
//! - Scheduler settings (slots, retention, timeouts, ports)
//! - The stage pipeline every build goes through
//! - Watched repositories
//! - Variable interpolation in stage commands

pub mod error;
mod node;
pub mod pipeline;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{PipelineConfig, ResultPatterns, StageConfig};
pub use system::{Settings, SystemConfig, load_system_config, parse_system_config};
pub use variables::{
    BuildContext, GitContext, StageContext, VariableContext, VariableContextBuilder,
};

//! Port pairs for serving builds.

use runnel_core::BuildState;
use runnel_db::{BuildFilter, BuildOrder};
use std::collections::HashSet;

use crate::{Context, Result, SchedulerError};

/// Lowest even-offset port from `start` whose pair is free.
///
/// Each build takes `port` and `port + 1`, so candidates step by two.
pub fn find_port(used: &HashSet<u16>, start: u16) -> Option<u16> {
    let mut port = start;
    loop {
        if !used.contains(&port) {
            return Some(port);
        }
        port = port.checked_add(2)?;
    }
}

/// Pick a port not held by any testing, running or duplicate build.
pub async fn allocate(ctx: &Context) -> Result<u16> {
    let filter = BuildFilter::new().states(&[
        BuildState::Testing,
        BuildState::Running,
        BuildState::Duplicate,
    ]);
    let used: HashSet<u16> = ctx
        .store
        .search_builds(&filter, BuildOrder::SequenceAsc, None, 0)
        .await?
        .into_iter()
        .filter_map(|b| b.port)
        .collect();
    find_port(&used, ctx.settings.starting_port)
        .ok_or(SchedulerError::PortsExhausted(ctx.settings.starting_port))
}

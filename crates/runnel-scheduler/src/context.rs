//! Everything a scheduler tick needs, bundled once.

use chrono::{DateTime, Utc};
use runnel_config::{PipelineConfig, Settings, SystemConfig};
use runnel_core::executor::{ProcessRunner, Provisioner};
use runnel_core::hosting::HostingProvider;
use runnel_core::source::SourceProvider;
use runnel_core::{Build, Clock, RepoId, Repository};
use runnel_db::BuildStore;
use std::sync::Arc;

use crate::{Result, SchedulerError, Workspace};

/// Configuration plus the collaborators behind every side effect.
///
/// Tests swap the trait objects for fakes; production wires the store,
/// local process runner, git and hosting clients.
#[derive(Clone)]
pub struct Context {
    pub settings: Settings,
    pub pipeline: PipelineConfig,
    pub repositories: Vec<Repository>,
    /// Identity of this scheduler instance.
    pub host: String,
    pub store: Arc<dyn BuildStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub provisioner: Arc<dyn Provisioner>,
    pub sources: Arc<dyn SourceProvider>,
    pub hosting: Arc<dyn HostingProvider>,
    pub clock: Arc<dyn Clock>,
}

/// The trait objects of a `Context`.
pub struct Services {
    pub store: Arc<dyn BuildStore>,
    pub runner: Arc<dyn ProcessRunner>,
    pub provisioner: Arc<dyn Provisioner>,
    pub sources: Arc<dyn SourceProvider>,
    pub hosting: Arc<dyn HostingProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Context {
    pub fn new(config: SystemConfig, host: impl Into<String>, services: Services) -> Self {
        Self {
            settings: config.settings,
            pipeline: config.pipeline,
            repositories: config.repositories,
            host: host.into(),
            store: services.store,
            runner: services.runner,
            provisioner: services.provisioner,
            sources: services.sources,
            hosting: services.hosting,
            clock: services.clock,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn repository(&self, id: &RepoId) -> Result<&Repository> {
        self.repositories
            .iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| SchedulerError::UnknownRepository(id.clone()))
    }

    pub fn workspace(&self, build: &Build) -> Workspace {
        Workspace::new(&self.settings.root, build)
    }
}

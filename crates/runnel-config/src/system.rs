//! System configuration parsing.

use crate::node::{
    get_all_string_args, get_first_bool_arg, get_first_int_arg, get_first_string_arg,
    get_string_prop,
};
use crate::pipeline::{PipelineConfig, parse_pipeline_node};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use runnel_core::{Credentials, Dependency, HostingKind, RepoId, Repository};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_TESTING_SLOTS: usize = 6;
pub const DEFAULT_RUNNING_SLOTS: usize = 75;
pub const DEFAULT_RETENTION_DAYS: i64 = 30;
pub const MAX_RETENTION_DAYS: i64 = 36_500;
pub const DEFAULT_STAGE_TIMEOUT_SECS: i64 = 1800;
pub const DEFAULT_STARTING_PORT: u16 = 2000;
pub const DEFAULT_STATUS_CONTEXT: &str = "continuous-integration/runnel";

/// Scheduler-wide knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Identity of this scheduler instance; the machine hostname when unset.
    pub host: Option<String>,
    /// Workspace root holding bare clones and build directories.
    pub root: PathBuf,
    /// Public domain used in status target URLs.
    pub domain: Option<String>,
    pub testing_slots: usize,
    pub running_slots: usize,
    pub retention_days: i64,
    pub stage_timeout_secs: i64,
    pub starting_port: u16,
    pub status_context: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: None,
            root: PathBuf::from("/var/lib/runnel"),
            domain: None,
            testing_slots: DEFAULT_TESTING_SLOTS,
            running_slots: DEFAULT_RUNNING_SLOTS,
            retention_days: DEFAULT_RETENTION_DAYS,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            starting_port: DEFAULT_STARTING_PORT,
            status_context: DEFAULT_STATUS_CONTEXT.to_string(),
        }
    }
}

impl Settings {
    /// Testing budget for `repo`, falling back to the global one.
    pub fn testing_slots_for(&self, repo: &Repository) -> usize {
        repo.testing_slots.unwrap_or(self.testing_slots)
    }

    /// Running budget for `repo`, falling back to the global one.
    pub fn running_slots_for(&self, repo: &Repository) -> usize {
        repo.running_slots.unwrap_or(self.running_slots)
    }
}

/// Complete orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub settings: Settings,
    pub pipeline: PipelineConfig,
    pub repositories: Vec<Repository>,
}

impl SystemConfig {
    pub fn repository(&self, id: &RepoId) -> Option<&Repository> {
        self.repositories.iter().find(|r| &r.id == id)
    }

    /// Repositories handled by the periodic tick.
    pub fn auto_repositories(&self) -> impl Iterator<Item = &Repository> {
        self.repositories.iter().filter(|r| r.auto)
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: &Path) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut settings = Settings::default();
    let mut pipeline = None;
    let mut repositories: Vec<Repository> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "settings" => {
                settings = parse_settings(node)?;
            }
            "pipeline" => {
                if pipeline.is_some() {
                    return Err(ConfigError::Duplicate("pipeline".to_string()));
                }
                pipeline = Some(parse_pipeline_node(node)?);
            }
            "repository" => {
                let repo = parse_repository(node)?;
                if repositories.iter().any(|r| r.id == repo.id) {
                    return Err(ConfigError::Duplicate(format!("repository '{}'", repo.id)));
                }
                repositories.push(repo);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    let pipeline = pipeline.ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;

    // Validate cross-repository references
    for repo in &repositories {
        let known = |id: &RepoId| repositories.iter().any(|r| &r.id == id);
        if let Some(target) = &repo.dedup_target {
            if !known(target) {
                return Err(ConfigError::InvalidReference(format!(
                    "repository '{}' dedups against unknown repository '{}'",
                    repo.id, target
                )));
            }
        }
        for dep in &repo.dependencies {
            if !known(dep.repo()) {
                return Err(ConfigError::InvalidReference(format!(
                    "repository '{}' depends on unknown repository '{}'",
                    repo.id,
                    dep.repo()
                )));
            }
        }
    }

    Ok(SystemConfig {
        settings,
        pipeline,
        repositories,
    })
}

fn parse_settings(node: &KdlNode) -> ConfigResult<Settings> {
    let mut settings = Settings::default();

    let Some(children) = node.children() else {
        return Ok(settings);
    };

    for child in children.nodes() {
        match child.name().value() {
            "host" => settings.host = get_first_string_arg(child),
            "root" => {
                if let Some(root) = get_first_string_arg(child) {
                    settings.root = PathBuf::from(root);
                }
            }
            "domain" => settings.domain = get_first_string_arg(child),
            "testing-slots" => {
                settings.testing_slots =
                    get_first_int_arg(child)?.unwrap_or(settings.testing_slots);
            }
            "running-slots" => {
                settings.running_slots =
                    get_first_int_arg(child)?.unwrap_or(settings.running_slots);
            }
            "retention-days" => {
                settings.retention_days =
                    get_first_int_arg(child)?.unwrap_or(settings.retention_days);
            }
            "stage-timeout" => {
                settings.stage_timeout_secs =
                    get_first_int_arg(child)?.unwrap_or(settings.stage_timeout_secs);
            }
            "starting-port" => {
                settings.starting_port =
                    get_first_int_arg(child)?.unwrap_or(settings.starting_port);
            }
            "status-context" => {
                if let Some(context) = get_first_string_arg(child) {
                    settings.status_context = context;
                }
            }
            _ => {}
        }
    }

    if settings.testing_slots == 0 {
        return Err(ConfigError::InvalidValue {
            field: "testing-slots".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if !(1..=MAX_RETENTION_DAYS).contains(&settings.retention_days) {
        return Err(ConfigError::InvalidValue {
            field: "retention-days".to_string(),
            message: format!("must be between 1 and {}", MAX_RETENTION_DAYS),
        });
    }

    Ok(settings)
}

fn parse_repository(node: &KdlNode) -> ConfigResult<Repository> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("repository url".to_string()))?;

    let mut repo = Repository::new(name.as_str(), HostingKind::default());
    let mut token = None;
    let mut username = None;
    let mut password = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "hosting" => {
                    let value = get_first_string_arg(child).unwrap_or_default();
                    repo.hosting =
                        value
                            .parse()
                            .map_err(|message| ConfigError::InvalidValue {
                                field: "hosting".to_string(),
                                message,
                            })?;
                }
                "token" => token = get_first_string_arg(child),
                "username" => username = get_first_string_arg(child),
                "password" => password = get_first_string_arg(child),
                "testing-slots" => repo.testing_slots = get_first_int_arg(child)?,
                "running-slots" => repo.running_slots = get_first_int_arg(child)?,
                "dedup-target" => repo.dedup_target = get_first_string_arg(child).map(RepoId::from),
                "modules" => repo.modules = get_first_string_arg(child),
                "sticky" => repo.sticky.extend(get_all_string_args(child)),
                "dependency" => {
                    let dep = get_first_string_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("dependency url for '{}'", name))
                    })?;
                    repo.dependencies.push(match get_string_prop(child, "ref") {
                        Some(reference) => Dependency::Nested {
                            repo: RepoId::from(dep),
                            reference,
                        },
                        None => Dependency::Flat(RepoId::from(dep)),
                    });
                }
                "auto" => repo.auto = get_first_bool_arg(child).unwrap_or(true),
                "visible" => repo.visible = get_first_bool_arg(child).unwrap_or(true),
                _ => {}
            }
        }
    }

    repo.credentials = match (token, username, password) {
        (Some(token), _, _) => Credentials::Token(token),
        (None, Some(username), Some(password)) => Credentials::Basic { username, password },
        _ => Credentials::None,
    };

    Ok(repo)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
        pipeline {
            stage "test_base" cpu-limit=300 database="base" { run "./server" "-i" "base" }
            stage "test_all" cpu-limit=2100 database="all" { run "./server" "-i" "${build.modules}" }
            stage "run" database="all" stderr=#true { run "./server" }
        }
    "#;

    #[test]
    fn test_defaults_when_settings_missing() {
        let config = parse_system_config(PIPELINE).unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.testing_slots, 6);
        assert_eq!(config.settings.running_slots, 75);
        assert_eq!(config.settings.retention_days, 30);
        assert_eq!(config.settings.stage_timeout_secs, 1800);
        assert_eq!(config.settings.starting_port, 2000);
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_parse_settings_and_repositories() {
        let kdl = format!(
            r#"
            settings {{
                host "ci-1"
                root "/srv/runnel"
                domain "runbot.example.com"
                testing-slots 2
                running-slots 4
                retention-days 10
                stage-timeout 60
                starting-port 3000
            }}
            {PIPELINE}
            repository "https://github.com/acme/app.git" {{
                hosting "github"
                token "secret"
                testing-slots 1
                dedup-target "https://github.com/acme-dev/app.git"
                modules "base,web"
                sticky "main" "release-1.0"
                dependency "https://bitbucket.org/acme/addons.git"
                dependency "https://bitbucket.org/acme/addons.git" ref="refs/heads/main"
            }}
            repository "https://github.com/acme-dev/app.git" {{
                auto #false
                visible #false
            }}
            repository "https://bitbucket.org/acme/addons.git" {{
                hosting "bitbucket"
                username "bot"
                password "hunter2"
            }}
            "#
        );

        let config = parse_system_config(&kdl).unwrap();
        let settings = &config.settings;
        assert_eq!(settings.host.as_deref(), Some("ci-1"));
        assert_eq!(settings.root, PathBuf::from("/srv/runnel"));
        assert_eq!(settings.testing_slots, 2);
        assert_eq!(settings.running_slots, 4);
        assert_eq!(settings.retention_days, 10);
        assert_eq!(settings.stage_timeout_secs, 60);
        assert_eq!(settings.starting_port, 3000);

        let app = &config.repositories[0];
        assert_eq!(app.hosting, HostingKind::Github);
        assert_eq!(app.credentials, Credentials::Token("secret".to_string()));
        assert_eq!(settings.testing_slots_for(app), 1);
        assert_eq!(settings.running_slots_for(app), 4);
        assert_eq!(
            app.dedup_target,
            Some(RepoId::new("https://github.com/acme-dev/app.git"))
        );
        assert_eq!(app.sticky, vec!["main", "release-1.0"]);
        assert!(matches!(app.dependencies[0], Dependency::Flat(_)));
        assert!(matches!(
            &app.dependencies[1],
            Dependency::Nested { reference, .. } if reference == "refs/heads/main"
        ));

        let dev = &config.repositories[1];
        assert!(!dev.auto);
        assert!(!dev.visible);
        assert_eq!(config.auto_repositories().count(), 2);

        let addons = &config.repositories[2];
        assert_eq!(addons.hosting, HostingKind::Bitbucket);
        assert!(matches!(addons.credentials, Credentials::Basic { .. }));
    }

    #[test]
    fn test_unknown_dedup_target_rejected() {
        let kdl = format!(
            r#"
            {PIPELINE}
            repository "https://github.com/acme/app.git" {{
                dedup-target "https://github.com/acme/missing.git"
            }}
            "#
        );

        assert!(matches!(
            parse_system_config(&kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_retention_days_bounded() {
        for days in ["0", "-3", "9223372036854775807"] {
            let kdl = format!(
                r#"
                settings {{
                    retention-days {days}
                }}
                {PIPELINE}
                "#
            );
            let err = parse_system_config(&kdl).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { field, .. } if field == "retention-days"),
                "{days}: {err}"
            );
        }
    }

    #[test]
    fn test_unknown_hosting_rejected() {
        let kdl = format!(
            r#"
            {PIPELINE}
            repository "https://gitlab.com/acme/app.git" {{
                hosting "gitlab"
            }}
            "#
        );

        assert!(matches!(
            parse_system_config(&kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_missing_pipeline_rejected() {
        assert!(matches!(
            parse_system_config("settings { testing-slots 1 }").unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }
}

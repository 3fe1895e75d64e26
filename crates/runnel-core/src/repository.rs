//! Repository types for watched source repositories.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::{Error, RepoId, Result};

/// Hosting provider owning a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HostingKind {
    #[default]
    Github,
    Bitbucket,
}

impl std::fmt::Display for HostingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostingKind::Github => write!(f, "github"),
            HostingKind::Bitbucket => write!(f, "bitbucket"),
        }
    }
}

impl std::str::FromStr for HostingKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "github" => Ok(HostingKind::Github),
            "bitbucket" => Ok(HostingKind::Bitbucket),
            _ => Err(format!("Unknown hosting provider: {}", s)),
        }
    }
}

/// Credentials used against the hosting provider API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Credentials {
    #[default]
    None,
    Token(String),
    Basic { username: String, password: String },
}

impl Credentials {
    pub fn is_none(&self) -> bool {
        matches!(self, Credentials::None)
    }
}

/// An extra repository exported next to the build sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    /// Exported at the branch closest to the build's branch.
    Flat(RepoId),
    /// Exported at an explicit ref.
    Nested { repo: RepoId, reference: String },
}

impl Dependency {
    pub fn repo(&self) -> &RepoId {
        match self {
            Dependency::Flat(repo) => repo,
            Dependency::Nested { repo, .. } => repo,
        }
    }
}

/// A watched repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    /// Clone URL, also the repository identity.
    pub id: RepoId,
    pub hosting: HostingKind,
    pub credentials: Credentials,
    /// Per-host testing budget; the global setting applies when unset.
    pub testing_slots: Option<usize>,
    /// Per-host running budget; the global setting applies when unset.
    pub running_slots: Option<usize>,
    /// Repository whose builds may be reused instead of re-testing.
    pub dedup_target: Option<RepoId>,
    pub dependencies: Vec<Dependency>,
    /// Comma separated modules to install.
    pub modules: Option<String>,
    /// Short branch names that are always tested.
    pub sticky: Vec<String>,
    /// Synced and scheduled by the periodic tick.
    pub auto: bool,
    pub visible: bool,
}

impl Repository {
    pub fn new(id: impl Into<RepoId>, hosting: HostingKind) -> Self {
        Self {
            id: id.into(),
            hosting,
            credentials: Credentials::None,
            testing_slots: None,
            running_slots: None,
            dedup_target: None,
            dependencies: Vec::new(),
            modules: None,
            sticky: Vec::new(),
            auto: true,
            visible: true,
        }
    }

    /// Normalized `host/owner/name` form of the clone URL.
    pub fn base(&self) -> Result<RepoBase> {
        RepoBase::parse(self.id.as_str())
    }

    pub fn is_sticky_branch(&self, short_name: &str) -> bool {
        self.sticky.iter().any(|s| s == short_name)
    }

    /// Location of the bare clone under the workspace root.
    pub fn path(&self, root: &Path) -> PathBuf {
        let name: String = self
            .id
            .as_str()
            .chars()
            .map(|c| if matches!(c, '@' | ':' | '/') { '_' } else { c })
            .collect();
        root.join("repo").join(name)
    }
}

/// A clone URL reduced to its host and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoBase {
    pub host: String,
    pub owner: String,
    pub name: String,
    path: String,
}

impl RepoBase {
    /// Parse `git@host:owner/repo.git`, `https://host/owner/repo(.git)` or
    /// `host/owner/repo`.
    pub fn parse(input: &str) -> Result<Self> {
        let url = if let Some(rest) = input.strip_prefix("git@") {
            let (host, path) = rest
                .split_once(':')
                .ok_or_else(|| Error::InvalidInput(format!("malformed ssh url: {}", input)))?;
            parse_url(&format!("https://{}/{}", host, path.trim_start_matches('/')))?
        } else if input.starts_with("http://") || input.starts_with("https://") {
            parse_url(input)?
        } else if input.contains("://") {
            return Err(Error::UnsupportedScheme(input.to_string()));
        } else {
            parse_url(&format!("https://{}", input))?
        };

        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("missing host: {}", input)))?
            .to_string();

        let mut path = url.path().trim_end_matches('/').to_string();
        if let Some(stripped) = path.strip_suffix(".git") {
            path = stripped.to_string();
        }

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let [.., owner, name] = segments.as_slice() else {
            return Err(Error::InvalidInput(format!(
                "expected owner/repository in {}",
                input
            )));
        };

        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
            path: path.clone(),
            host,
        })
    }
}

impl std::fmt::Display for RepoBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.host, self.path)
    }
}

fn parse_url(input: &str) -> Result<Url> {
    Url::parse(input).map_err(|e| Error::InvalidInput(format!("{}: {}", input, e)))
}

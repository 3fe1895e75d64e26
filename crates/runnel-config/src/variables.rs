//! Variable interpolation for stage commands.
//!
//! Supports variables like:
//! - `${git.sha}` - Full commit SHA
//! - `${git.short_sha}` - First 6 characters of the SHA
//! - `${git.branch}` - Short branch name
//! - `${git.ref}` - Full ref name
//! - `${build.id}` - Build id
//! - `${build.dest}` - Build directory and database prefix
//! - `${build.path}` - Build workspace directory
//! - `${build.port}` - Primary port
//! - `${build.port2}` - Secondary port
//! - `${build.db}` - Database of the current stage
//! - `${build.modules}` - Modules to install
//! - `${stage.name}` - Current stage name
//! - `${stage.index}` - Current stage position
//! - `${env.VAR_NAME}` - Environment variable

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub build: BuildContext,
    pub stage: StageContext,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub ref_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub id: String,
    pub dest: String,
    pub path: String,
    pub port: Option<u16>,
    pub db: Option<String>,
    pub modules: String,
}

#[derive(Debug, Clone, Default)]
pub struct StageContext {
    pub name: String,
    pub index: usize,
}

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "ref"] => Some(self.git.ref_name.clone()),

            ["build", "id"] => Some(self.build.id.clone()),
            ["build", "dest"] => Some(self.build.dest.clone()),
            ["build", "path"] => Some(self.build.path.clone()),
            ["build", "port"] => self.build.port.map(|p| p.to_string()),
            ["build", "port2"] => self
                .build
                .port
                .and_then(|p| p.checked_add(1))
                .map(|p| p.to_string()),
            ["build", "db"] => self.build.db.clone(),
            ["build", "modules"] => Some(self.build.modules.clone()),

            ["stage", "name"] => Some(self.stage.name.clone()),
            ["stage", "index"] => Some(self.stage.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    ///
    /// Unknown variables are left as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(6).collect();
        self.ctx.git.sha = sha;
        self
    }

    /// Set the full ref; the short branch name is derived from it.
    pub fn with_git_ref(mut self, ref_name: impl Into<String>) -> Self {
        let ref_name = ref_name.into();
        self.ctx.git.branch = runnel_core::build::short_name(&ref_name).to_string();
        self.ctx.git.ref_name = ref_name;
        self
    }

    pub fn with_build(
        mut self,
        id: impl Into<String>,
        dest: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        self.ctx.build.id = id.into();
        self.ctx.build.dest = dest.into();
        self.ctx.build.path = path.into();
        self
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.ctx.build.port = port;
        self
    }

    pub fn with_database(mut self, db: Option<String>) -> Self {
        self.ctx.build.db = db;
        self
    }

    pub fn with_modules(mut self, modules: impl Into<String>) -> Self {
        self.ctx.build.modules = modules.into();
        self
    }

    pub fn with_stage(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.stage.name = name.into();
        self.ctx.stage.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Pipeline configuration parsing.
//!
//! Every build runs the same ordered list of stages. All stages but the last
//! are test stages; the last one serves the build until it is evicted.

use crate::node::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_int_prop, get_string_prop,
};
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name, also the lock and log file stem.
    pub name: String,
    /// Program and arguments, subject to variable interpolation.
    pub command: Vec<String>,
    /// Soft CPU limit in seconds.
    pub cpu_limit: Option<u64>,
    /// Suffix of the ephemeral database recreated before the stage runs.
    pub database: Option<String>,
    /// Send stderr to the stage log as well.
    pub capture_stderr: bool,
    /// Stage-specific environment variables.
    pub env: HashMap<String, String>,
}

/// Log patterns deciding the result of the test stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPatterns {
    /// Literal marker that must be present for the run to count at all.
    pub success: String,
    /// Multi-line regex; any match makes the result `ko`.
    pub error: String,
    /// Multi-line regex; any match makes the result `warn`.
    pub warning: String,
}

impl Default for ResultPatterns {
    fn default() -> Self {
        Self {
            success: ".modules.loading: Modules loaded.".to_string(),
            error: r"^(?:\d{4}-\d\d-\d\d \d\d:\d\d:\d\d,\d{3} \d+ (?:ERROR|CRITICAL) )|(?:Traceback \(most recent call last\):)$".to_string(),
            warning: r"^\d{4}-\d\d-\d\d \d\d:\d\d:\d\d,\d{3} \d+ WARNING ".to_string(),
        }
    }
}

/// The ordered stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub stages: Vec<StageConfig>,
    pub result: ResultPatterns,
}

impl PipelineConfig {
    pub fn first(&self) -> &StageConfig {
        &self.stages[0]
    }

    /// The serve stage.
    pub fn last(&self) -> &StageConfig {
        &self.stages[self.stages.len() - 1]
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn is_last(&self, name: &str) -> bool {
        self.last().name == name
    }

    /// The final test stage, whose completion moves a build to running.
    pub fn is_last_test(&self, name: &str) -> bool {
        self.stages[self.stages.len() - 2].name == name
    }

    pub fn next_after(&self, name: &str) -> Option<&StageConfig> {
        self.index_of(name).and_then(|i| self.stages.get(i + 1))
    }

    /// Every database suffix used by some stage, in stage order.
    pub fn database_suffixes(&self) -> Vec<&str> {
        let mut suffixes: Vec<&str> = Vec::new();
        for stage in &self.stages {
            if let Some(db) = stage.database.as_deref() {
                if !suffixes.contains(&db) {
                    suffixes.push(db);
                }
            }
        }
        suffixes
    }
}

/// Parse a document holding a single `pipeline` node.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "pipeline")
        .ok_or_else(|| ConfigError::MissingField("pipeline".to_string()))?;
    parse_pipeline_node(node)
}

pub(crate) fn parse_pipeline_node(node: &KdlNode) -> ConfigResult<PipelineConfig> {
    let mut stages: Vec<StageConfig> = Vec::new();
    let mut result = ResultPatterns::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "stage" => {
                    let stage = parse_stage(child)?;
                    if stages.iter().any(|s| s.name == stage.name) {
                        return Err(ConfigError::Duplicate(format!("stage '{}'", stage.name)));
                    }
                    stages.push(stage);
                }
                "result" => {
                    result = parse_result(child)?;
                }
                _ => {} // Ignore unknown nodes
            }
        }
    }

    if stages.len() < 2 {
        return Err(ConfigError::InvalidValue {
            field: "pipeline".to_string(),
            message: "at least one test stage and one serve stage are required".to_string(),
        });
    }

    Ok(PipelineConfig { stages, result })
}

fn parse_stage(node: &KdlNode) -> ConfigResult<StageConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("stage name".to_string()))?;

    let cpu_limit = get_int_prop::<u64>(node, "cpu-limit")?;
    let database = get_string_prop(node, "database");
    let capture_stderr = get_bool_prop(node, "stderr").unwrap_or(false);

    let mut command = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "run" => {
                    if !command.is_empty() {
                        return Err(ConfigError::Duplicate(format!(
                            "run command for stage '{}'",
                            name
                        )));
                    }
                    command = get_all_string_args(child);
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                env.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if command.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run for stage '{}'",
            name
        )));
    }

    Ok(StageConfig {
        name,
        command,
        cpu_limit,
        database,
        capture_stderr,
        env,
    })
}

fn parse_result(node: &KdlNode) -> ConfigResult<ResultPatterns> {
    let mut patterns = ResultPatterns::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let value = get_first_string_arg(child);
            match (child.name().value(), value) {
                ("success", Some(v)) => patterns.success = v,
                ("error", Some(v)) => patterns.error = v,
                ("warning", Some(v)) => patterns.warning = v,
                _ => {}
            }
        }
    }

    for (field, pattern) in [("error", &patterns.error), ("warning", &patterns.warning)] {
        Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            field: format!("result {}", field),
            message: e.to_string(),
        })?;
    }

    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_pipeline() {
        let kdl = r#"
            pipeline {
                stage "test" cpu-limit=300 database="base" {
                    run "./server" "-d" "${build.db}"
                }
                stage "run" stderr=#true {
                    run "./server"
                }
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.stages.len(), 2);
        assert_eq!(pipeline.first().name, "test");
        assert_eq!(pipeline.first().cpu_limit, Some(300));
        assert_eq!(pipeline.first().database.as_deref(), Some("base"));
        assert_eq!(pipeline.first().command, vec!["./server", "-d", "${build.db}"]);
        assert!(pipeline.last().capture_stderr);
        assert!(pipeline.is_last("run"));
        assert!(pipeline.is_last_test("test"));
        assert_eq!(pipeline.result, ResultPatterns::default());
    }

    #[test]
    fn test_stage_navigation() {
        let kdl = r#"
            pipeline {
                stage "test_base" database="base" { run "a" }
                stage "test_all" database="all" { run "b" }
                stage "run" database="all" { run "c" }
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.next_after("test_base").unwrap().name, "test_all");
        assert_eq!(pipeline.next_after("test_all").unwrap().name, "run");
        assert!(pipeline.next_after("run").is_none());
        assert!(!pipeline.is_last_test("test_base"));
        assert!(pipeline.is_last_test("test_all"));
        assert_eq!(pipeline.database_suffixes(), vec!["base", "all"]);
    }

    #[test]
    fn test_result_patterns_override() {
        let kdl = r#"
            pipeline {
                result {
                    success "ALL DONE"
                    error "^FAIL"
                }
                stage "test" { run "a" }
                stage "run" { run "b" }
            }
        "#;

        let pipeline = parse_pipeline(kdl).unwrap();
        assert_eq!(pipeline.result.success, "ALL DONE");
        assert_eq!(pipeline.result.error, "^FAIL");
        assert_eq!(pipeline.result.warning, ResultPatterns::default().warning);
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let kdl = r#"
            pipeline {
                result { error "(unclosed" }
                stage "test" { run "a" }
                stage "run" { run "b" }
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_single_stage_rejected() {
        let kdl = r#"
            pipeline {
                stage "run" { run "b" }
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let kdl = r#"
            pipeline {
                stage "test" { run "a" }
                stage "test" { run "b" }
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_stage_without_command_rejected() {
        let kdl = r#"
            pipeline {
                stage "test" cpu-limit=10
                stage "run" { run "b" }
            }
        "#;

        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }
}

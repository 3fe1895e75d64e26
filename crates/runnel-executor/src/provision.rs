//! Ephemeral PostgreSQL databases through the client binaries.

use async_trait::async_trait;
use runnel_core::executor::Provisioner;
use runnel_core::{Error, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Creates and drops build databases with `createdb` and `dropdb`.
#[derive(Debug, Clone, Default)]
pub struct PostgresProvisioner {
    /// Extra connection flags, e.g. `--host=db`.
    connection: Vec<String>,
}

impl PostgresProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connection(connection: Vec<String>) -> Self {
        Self { connection }
    }

    fn drop_args(&self, name: &str) -> Vec<String> {
        let mut args = self.connection.clone();
        args.push("--if-exists".to_string());
        args.push(name.to_string());
        args
    }

    fn create_args(&self, name: &str) -> Vec<String> {
        let mut args = self.connection.clone();
        args.extend([
            "--encoding=unicode".to_string(),
            "--lc-collate=C".to_string(),
            "--template=template0".to_string(),
            name.to_string(),
        ]);
        args
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        debug!(program, ?args, "Running database command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: program.to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::Provision(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for PostgresProvisioner {
    async fn create_database(&self, name: &str) -> Result<()> {
        self.drop_database(name).await?;
        self.run("createdb", &self.create_args(name)).await?;
        info!(database = name, "Created database");
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.run("dropdb", &self.drop_args(name)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_arguments() {
        let provisioner = PostgresProvisioner::with_connection(vec!["--host=db".to_string()]);

        assert_eq!(
            provisioner.drop_args("00001-main-abcdef-all"),
            vec!["--host=db", "--if-exists", "00001-main-abcdef-all"]
        );
        let create = provisioner.create_args("00001-main-abcdef-all");
        assert_eq!(create.first().map(String::as_str), Some("--host=db"));
        assert!(create.contains(&"--template=template0".to_string()));
        assert_eq!(
            create.last().map(String::as_str),
            Some("00001-main-abcdef-all")
        );
    }
}

//! Source control through the `git` command line.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runnel_core::source::{RefInfo, SourceControl, SourceProvider};
use runnel_core::{Error, Repository, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

const REF_FORMAT: &str = "%(refname)%00%(objectname)%00%(committerdate:iso8601)%00%(authorname)%00%(subject)%00%(committername)";

/// A bare mirror of one remote repository.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_dir: PathBuf,
    remote: String,
}

impl GitCli {
    pub fn new(git_dir: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            git_dir: git_dir.into(),
            remote: remote.into(),
        }
    }

    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let git_dir = format!("--git-dir={}", self.git_dir.display());
        debug!(git_dir = %self.git_dir.display(), ?args, "Running git");

        let output = Command::new("git")
            .arg(&git_dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: format!("git {}", args.join(" ")),
                source,
            })?;

        if !output.status.success() {
            return Err(Error::SourceControl(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn clone_bare(&self) -> Result<()> {
        info!(remote = %self.remote, dest = %self.git_dir.display(), "Cloning bare repository");
        if let Some(parent) = self.git_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = Command::new("git")
            .args(["clone", "--bare", &self.remote])
            .arg(&self.git_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| Error::Spawn {
                command: "git clone".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::SourceControl(format!(
                "git clone {} failed: {}",
                self.remote,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn fetch(&self, refspecs: &[String]) -> Result<()> {
        if !self.git_dir.exists() {
            self.clone_bare().await?;
        }
        let mut args = vec!["fetch", "-p", "origin"];
        args.extend(refspecs.iter().map(String::as_str));
        self.git(&args).await?;
        Ok(())
    }

    async fn for_each_ref(&self) -> Result<Vec<RefInfo>> {
        let format = format!("--format={}", REF_FORMAT);
        let out = self
            .git(&[
                "for-each-ref",
                &format,
                "--sort=-committerdate",
                "refs/heads",
                "refs/pull",
                "refs/tags",
            ])
            .await?;
        parse_refs(&String::from_utf8_lossy(&out))
    }

    async fn export(&self, treeish: &str, dest: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dest).await?;
        let archive = self.git(&["archive", "--format=tar", treeish]).await?;

        let mut tar = Command::new("tar")
            .arg("-xmC")
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::Spawn {
                command: "tar".to_string(),
                source,
            })?;
        if let Some(mut stdin) = tar.stdin.take() {
            stdin.write_all(&archive).await?;
        }
        let output = tar.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::SourceControl(format!(
                "extracting {} into {} failed: {}",
                treeish,
                dest.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self.git(&["merge-base", a, b]).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn log_one(&self, sha: &str) -> Result<DateTime<Utc>> {
        let out = self
            .git(&["log", "-1", "--format=%cd", "--date=iso", sha])
            .await?;
        parse_date(String::from_utf8_lossy(&out).trim())
    }
}

/// Opens a `GitCli` per repository under `<root>/repo`.
#[derive(Debug, Clone)]
pub struct GitProvider {
    root: PathBuf,
}

impl GitProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SourceProvider for GitProvider {
    fn source(&self, repo: &Repository) -> Arc<dyn SourceControl> {
        Arc::new(GitCli::new(repo.path(&self.root), repo.id.as_str()))
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(s, DATE_FORMAT)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| Error::SourceControl(format!("bad commit date '{}': {}", s, e)))
}

fn parse_refs(out: &str) -> Result<Vec<RefInfo>> {
    out.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\0').collect();
            let [name, sha, date, author, subject, committer] = fields.as_slice() else {
                return Err(Error::SourceControl(format!("malformed ref line: {:?}", line)));
            };
            Ok(RefInfo {
                name: name.to_string(),
                sha: sha.to_string(),
                commit_date: parse_date(date)?,
                author: author.to_string(),
                subject: subject.to_string(),
                committer: committer.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use runnel_core::HostingKind;

    #[test]
    fn test_parse_refs() {
        let out = "refs/heads/main\0abc123\02024-03-01 10:00:00 +0100\0Ann\0Fix: a thing\0Bob\n\
                   refs/pull/42\0def456\02024-02-01 09:30:00 +0000\0Cid\0Add feature\0Cid\n";

        let refs = parse_refs(out).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "refs/heads/main");
        assert_eq!(refs[0].sha, "abc123");
        assert_eq!(
            refs[0].commit_date,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );
        assert_eq!(refs[0].author, "Ann");
        assert_eq!(refs[0].subject, "Fix: a thing");
        assert_eq!(refs[0].committer, "Bob");
        assert_eq!(refs[1].name, "refs/pull/42");
    }

    #[test]
    fn test_parse_refs_rejects_short_lines() {
        assert!(parse_refs("refs/heads/main\0abc\n").is_err());
    }

    #[test]
    fn test_provider_uses_flattened_path() {
        let provider = GitProvider::new("/srv/runnel");
        let repo = Repository::new("https://github.com/acme/app.git", HostingKind::Github);
        let cli = GitCli::new(repo.path(Path::new("/srv/runnel")), repo.id.as_str());
        assert_eq!(
            cli.git_dir(),
            Path::new("/srv/runnel/repo/https___github.com_acme_app.git")
        );
        // Opening a client never touches the filesystem
        let _ = provider.source(&repo);
    }
}

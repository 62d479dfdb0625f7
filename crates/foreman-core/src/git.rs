use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::PublishError;

/// Every git invocation is bounded; a hung network op must not stall a cycle.
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Working-tree operations the publisher needs.
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn checkout(&self, branch: &str) -> Result<(), PublishError>;

    async fn pull(&self, branch: &str) -> Result<(), PublishError>;

    /// Create (or reset) `branch` at the current HEAD and switch to it.
    async fn create_branch(&self, branch: &str) -> Result<(), PublishError>;

    async fn push(&self, branch: &str) -> Result<(), PublishError>;

    /// Force the tree onto `branch`, discarding local edits and untracked
    /// files left behind by a build.
    async fn restore(&self, branch: &str) -> Result<(), PublishError>;
}

pub struct Git {
    pub repo_path: PathBuf,
    pub remote: String,
}

impl Git {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            remote: "origin".into(),
        }
    }

    pub async fn exec(&self, args: &[&str]) -> Result<ExecResult, PublishError> {
        let step = args.first().copied().unwrap_or("git").to_string();
        let mut cmd = Command::new("git");
        cmd.arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(args = %args.join(" "), "git");
        let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| PublishError::GitTimeout { step })??;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn exec_checked(&self, args: &[&str]) -> Result<ExecResult, PublishError> {
        let result = self.exec(args).await?;
        if !result.success() {
            return Err(PublishError::Git {
                step: args.join(" "),
                output: result.combined_output().trim().to_string(),
            });
        }
        Ok(result)
    }

    pub async fn current_branch(&self) -> Result<String, PublishError> {
        let result = self.exec_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(result.stdout.trim().to_string())
    }
}

#[async_trait]
impl SourceControl for Git {
    async fn checkout(&self, branch: &str) -> Result<(), PublishError> {
        self.exec_checked(&["checkout", branch]).await?;
        Ok(())
    }

    async fn pull(&self, branch: &str) -> Result<(), PublishError> {
        self.exec_checked(&["pull", "--ff-only", &self.remote, branch])
            .await?;
        Ok(())
    }

    async fn create_branch(&self, branch: &str) -> Result<(), PublishError> {
        self.exec_checked(&["checkout", "-B", branch]).await?;
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<(), PublishError> {
        self.exec_checked(&["push", "-u", &self.remote, branch])
            .await?;
        Ok(())
    }

    async fn restore(&self, branch: &str) -> Result<(), PublishError> {
        self.exec_checked(&["reset", "--hard", "-q"]).await?;
        self.exec_checked(&["checkout", "-f", branch]).await?;
        self.exec_checked(&["clean", "-fdq"]).await?;
        Ok(())
    }
}

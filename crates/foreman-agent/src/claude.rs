use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use foreman_core::{
    agent::BuildRunner,
    config::Config,
    error::ExecError,
    process::{self, ExecOutcome, ProcessSpec},
    types::Task,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::instruction::build_instruction;

/// Runs the Claude Code CLI (or any command with the same calling
/// convention) as `<bin> [args...] <instruction>` in the repository root.
pub struct ClaudeRunner {
    /// Path to the build binary.
    pub bin: String,
    /// Flags placed before the instruction, e.g. `-p --verbose`.
    pub args: Vec<String>,
    pub repo_path: PathBuf,
    /// Per-build limit before graceful termination.
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub output_window: usize,
}

impl ClaudeRunner {
    pub fn new(bin: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            args: vec!["-p".into(), "--verbose".into()],
            repo_path: repo_path.into(),
            timeout: Duration::from_secs(600),
            kill_grace: Duration::from_secs(10),
            output_window: 4000,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bin: config.build_cmd.clone(),
            args: config.build_args.clone(),
            repo_path: config.repo_path.clone(),
            timeout: config.timeout,
            kill_grace: config.kill_grace,
            output_window: config.output_window,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, kill_grace: Duration) -> Self {
        self.timeout = timeout;
        self.kill_grace = kill_grace;
        self
    }

    pub fn with_output_window(mut self, chars: usize) -> Self {
        self.output_window = chars;
        self
    }

    pub fn spec_for(&self, task: &Task) -> ProcessSpec {
        let mut args = self.args.clone();
        args.push(build_instruction(task));
        ProcessSpec {
            program: self.bin.clone(),
            args,
            cwd: self.repo_path.clone(),
            env: Vec::new(),
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            output_window: self.output_window,
        }
    }
}

#[async_trait]
impl BuildRunner for ClaudeRunner {
    fn name(&self) -> &str {
        &self.bin
    }

    async fn run_build(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecError> {
        let spec = self.spec_for(task);
        info!(
            task_id = %task.id,
            bin = %self.bin,
            instruction_len = spec.args.last().map_or(0, String::len),
            "starting build"
        );
        let outcome = process::run(&spec, &cancel).await?;
        if outcome.timed_out {
            warn!(task_id = %task.id, timeout_s = self.timeout.as_secs(), "build timed out");
        }
        info!(
            task_id = %task.id,
            exit_code = outcome.exit_code,
            success = outcome.success(),
            duration_ms = outcome.duration.as_millis() as u64,
            "build finished"
        );
        Ok(outcome)
    }
}

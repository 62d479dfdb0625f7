use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::ExecError, process::ExecOutcome, types::Task};

/// Runs the external build for one claimed task inside the repository.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    /// Human-readable command name, for logs and activity details.
    fn name(&self) -> &str;

    /// Build `task`. A non-zero exit or a timeout is an `Ok` outcome; only a
    /// local environment problem (spawn failure) is an `Err`. Cancelling
    /// `cancel` terminates the build.
    async fn run_build(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> Result<ExecOutcome, ExecError>;
}

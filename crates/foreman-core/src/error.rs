use thiserror::Error;

/// Failures talking to the shared task store.
///
/// A lost claim race is not an error: `try_claim` returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("connection pool setup failed: {0}")]
    PoolBuild(#[from] deadpool_postgres::BuildError),

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("malformed record {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("invalid store url: {0}")]
    InvalidUrl(String),

    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures launching or supervising the external build process.
///
/// A non-zero exit or a timeout is an `ExecOutcome`, not an error. Only a
/// local environment problem ends up here.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("build process i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures in the branch / push / pull-request steps.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("git {step} failed: {output}")]
    Git { step: String, output: String },

    #[error("git {step} timed out")]
    GitTimeout { step: String },

    #[error("failed to run git: {0}")]
    Io(#[from] std::io::Error),

    #[error("pull request request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pull request rejected ({status}): {body}")]
    Status { status: u16, body: String },
}

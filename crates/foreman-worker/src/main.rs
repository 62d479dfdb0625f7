mod logging;

use std::sync::Arc;

use anyhow::Context;
use foreman_agent::ClaudeRunner;
use foreman_core::{
    config::Config,
    git::{Git, SourceControl},
    github::{GitHub, PullRequestHost},
    lifecycle::AgentLifecycle,
    publisher::Publisher,
    queue::QueueClient,
    store,
    worker::{Worker, WorkerSettings},
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env()?;

    info!("foreman worker agent");
    info!(agent_id = %config.agent_id, agent_type = %config.agent_type, "identity");
    info!(machine = %config.machine_url, repo = %config.repo_path.display(), "host");
    info!(
        capabilities = %config.capabilities.join(","),
        timeout_s = config.timeout.as_secs(),
        build_cmd = %config.build_cmd,
        "settings"
    );

    let store = store::connect(&config.store_url, &config.store_key)
        .await
        .context("failed to open task store")?;
    if config.store_url.starts_with("memory://") {
        warn!("using in-memory task store, nothing will be shared with other agents");
    }

    let queue = QueueClient::new(Arc::clone(&store), config.agent_id.clone());

    let scm: Arc<dyn SourceControl> = Arc::new(Git::new(config.repo_path.clone()));
    let host = GitHub::from_credentials(
        &config.github_api_url,
        &config.github_repo,
        &config.github_token,
    )?
    .map(|gh| Arc::new(gh) as Arc<dyn PullRequestHost>);
    if host.is_none() {
        info!("GITHUB_TOKEN or GITHUB_REPO not set, pull requests disabled");
    }
    let publisher = Publisher::new(
        scm,
        host,
        queue.clone(),
        config.default_branch.clone(),
        config.branch_prefix.clone(),
    );

    let lifecycle = AgentLifecycle::new(Arc::clone(&store), config.identity());
    lifecycle
        .register()
        .await
        .context("agent registration failed, refusing to start")?;

    let runner = Arc::new(ClaudeRunner::from_config(&config));
    let worker = Worker::new(
        queue,
        publisher,
        lifecycle,
        runner,
        WorkerSettings::from_config(&config),
    );

    worker.run(shutdown_signal()).await;
    info!("foreman worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("received interrupt"),
        _ = terminate => info!("received terminate"),
    }
}

//! Main daemon command - wires every component together and starts the
//! scheduler loop and the streaming HTTP surface.
//!
//! Grounded on the teacher's `cmd::root::run`: load configuration, build the
//! long-lived collaborators, spawn background tasks against a shared
//! `CancellationToken`, serve HTTP, and tear everything down on SIGINT.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use convo_engine::broadcaster::LogBroadcaster;
use convo_engine::config::EngineConfig;
use convo_engine::container::ContainerCommandBuilder;
use convo_engine::credentials::CredentialMaterializer;
use convo_engine::execution::{ExecutionManager, MaxConcurrency};
use convo_engine::executor::{ConversationExecutor, LoggingNotificationSink};
use convo_engine::repository::{Repository, SqliteRepository};
use convo_engine::scheduler;
use convo_engine::streaming::{self, AppState};
use convo_engine::supervisor::ChildProcessSupervisor;
use convo_engine::workspace::WorkspaceManager;

pub async fn run(config_path: &str, bind_addr: &str) -> Result<()> {
    info!("loading configuration from {config_path}");
    let config = EngineConfig::load(config_path)?;

    let repository: Arc<dyn Repository> = Arc::new(SqliteRepository::open(&config.database_path)?);
    let execution_manager = Arc::new(ExecutionManager::new(MaxConcurrency::new(config.max_concurrent_tasks)));
    let workspace = Arc::new(WorkspaceManager::new(config.workspace_base_dir.clone()));
    let credentials = Arc::new(CredentialMaterializer::new(&config.symmetric_key_bytes()?)?);
    let container_builder = Arc::new(ContainerCommandBuilder::new(config.container_runtime_command.clone()));
    let supervisor = Arc::new(ChildProcessSupervisor::new(config.container_runtime_command.clone()));
    let (broadcaster, dispatcher_handle) = LogBroadcaster::spawn();
    let janitor_handle = broadcaster.spawn_janitor();

    let executor = Arc::new(ConversationExecutor::new(
        repository.clone(),
        execution_manager.clone(),
        workspace,
        credentials,
        container_builder,
        supervisor,
        broadcaster.clone(),
        Arc::new(LoggingNotificationSink),
        config.network_config(),
        config.container_execution_timeout(),
        config.git_clone_timeout(),
    ));

    let scheduler_handle = scheduler::spawn(
        repository.clone(),
        execution_manager.clone(),
        executor.clone(),
        config.scheduler_interval(),
    );

    let state = AppState { repository: repository.clone(), broadcaster };
    let app = streaming::build_router(state);

    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received shutdown signal");
            shutdown_signal.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    scheduler_handle.stop();

    let running_ids = execution_manager.running_ids();
    if !running_ids.is_empty() {
        warn!(count = running_ids.len(), "cancelling in-flight conversations for shutdown");
        for id in &running_ids {
            execution_manager.cancel(id);
        }
        wait_for_reconciliation(&*repository, &running_ids).await;
    }

    scheduler_handle.join().await;
    dispatcher_handle.abort();
    janitor_handle.abort();

    info!("daemon stopped");
    Ok(())
}

/// Blocks until every id in `conversation_ids` has reached a terminal status
/// (or a bounded number of polls elapses), so shutdown doesn't race the
/// executor's own reconciliation of the cancellation it just requested.
async fn wait_for_reconciliation(repository: &dyn Repository, conversation_ids: &[String]) {
    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);
    const MAX_POLLS: usize = 100;

    for _ in 0..MAX_POLLS {
        let mut all_terminal = true;
        for id in conversation_ids {
            match repository.get_bare_conversation(id).await {
                Ok(conv) if conv.status.is_terminal() => {}
                Ok(_) => all_terminal = false,
                Err(e) => warn!(conversation_id = %id, error = %e, "failed to poll conversation during shutdown"),
            }
        }
        if all_terminal {
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    warn!("timed out waiting for in-flight conversations to reconcile during shutdown");
}

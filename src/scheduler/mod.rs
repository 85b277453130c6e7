//! Scheduler loop.
//!
//! Grounded on the teacher's `cron::Scheduler`: a named job spawned on an
//! interval ticker with a `JobHandle` the owner can cancel. Here there is
//! exactly one job — "dispatch due conversations" — so the general-purpose
//! job table is dropped in favor of a single spawned loop, but the
//! skip-first-tick-unless-run-immediately and cancellation-token shutdown
//! idiom carries over directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error};

use crate::execution::SharedExecutionManager;
use crate::executor::ConversationExecutor;
use crate::repository::Repository;

/// Handle to the running dispatch loop; dropping it does not stop the loop,
/// `stop()` must be called explicitly (mirrors the teacher's `JobHandle`).
pub struct SchedulerHandle {
    cancelled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Periodic tick that fetches pending conversations and admits as many as
/// the Execution Manager has room for, in stable creation-time order.
///
/// A tick is idempotent (**P8**): a conversation skipped this tick (not yet
/// due, already running, or admission refused) is left untouched and simply
/// resurfaces next tick. Nothing here mutates persisted state directly —
/// `ConversationExecutor::process` alone owns the `Pending` -> `Running`
/// transition.
pub fn spawn(
    repository: Arc<dyn Repository>,
    execution_manager: SharedExecutionManager,
    executor: Arc<ConversationExecutor>,
    interval: Duration,
) -> SchedulerHandle {
    let cancelled = Arc::new(AtomicBool::new(false));
    let cancelled_clone = cancelled.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if cancelled_clone.load(Ordering::SeqCst) {
                debug!("scheduler loop stopping");
                break;
            }

            if let Err(e) = run_tick(&repository, &execution_manager, &executor).await {
                error!("scheduler tick failed: {e}");
            }
        }
    });

    SchedulerHandle { cancelled, task }
}

async fn run_tick(
    repository: &Arc<dyn Repository>,
    execution_manager: &SharedExecutionManager,
    executor: &Arc<ConversationExecutor>,
) -> Result<(), crate::error::RepositoryError> {
    let mut candidates = repository.list_pending_with_details().await?;
    candidates.sort_by_key(|d| d.conversation.created_at);

    let now = chrono::Utc::now();

    for details in candidates {
        if !details.conversation.is_due(now) {
            continue;
        }

        if execution_manager.is_running(&details.conversation.id) {
            continue;
        }

        if !execution_manager.can_admit() {
            debug!("scheduler tick stopping early: execution manager at capacity");
            break;
        }

        executor.process(&details.conversation.id).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::LogBroadcaster;
    use crate::container::ContainerCommandBuilder;
    use crate::credentials::CredentialMaterializer;
    use crate::domain::{Conversation, ConversationStatus, GitProtocol, Project, Task, TaskStatus};
    use crate::execution::{ExecutionManager, MaxConcurrency};
    use crate::executor::LoggingNotificationSink;
    use crate::repository::SqliteRepository;
    use crate::supervisor::ChildProcessSupervisor;
    use crate::workspace::{GitNetworkConfig, WorkspaceManager};
    use tempfile::tempdir;

    fn executor_with(
        repo: Arc<SqliteRepository>,
        base_dir: &std::path::Path,
        max_concurrency: usize,
    ) -> (Arc<ConversationExecutor>, Arc<ExecutionManager>) {
        let execution_manager = Arc::new(ExecutionManager::new(MaxConcurrency::new(max_concurrency)));
        let executor = Arc::new(ConversationExecutor::new(
            repo as Arc<dyn Repository>,
            execution_manager.clone(),
            Arc::new(WorkspaceManager::new(base_dir)),
            Arc::new(CredentialMaterializer::new(&[9u8; 32]).unwrap()),
            Arc::new(ContainerCommandBuilder::new("docker")),
            Arc::new(ChildProcessSupervisor::new("docker")),
            LogBroadcaster::spawn().0,
            Arc::new(LoggingNotificationSink) as Arc<dyn crate::executor::NotificationSink>,
            GitNetworkConfig { tls_verify: true, ..Default::default() },
            Duration::from_secs(30),
            Duration::from_secs(30),
        ));
        (executor, execution_manager)
    }

    fn due_conversation(id: &str, task_id: &str) -> Conversation {
        Conversation {
            id: id.into(),
            task_id: task_id.into(),
            content: "do work".into(),
            attachments: vec![],
            execution_time: None,
            env_params: serde_json::json!({}),
            status: ConversationStatus::Pending,
            created_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn a_tick_with_no_pending_conversations_is_a_no_op() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let base_dir = tempdir().unwrap();
        let (executor, execution_manager) = executor_with(repo.clone(), base_dir.path(), 2);

        run_tick(&(repo as Arc<dyn Repository>), &execution_manager, &executor).await.unwrap();

        assert_eq!(execution_manager.running_count(), 0);
    }

    #[tokio::test]
    async fn a_conversation_missing_its_dev_environment_fails_fast_and_does_not_block_later_ticks() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let project = Project {
            id: "proj-1".into(),
            repo_url: "https://example.invalid/repo.git".into(),
            protocol: GitProtocol::Https,
            credential_id: None,
        };
        let task = Task {
            id: "task-1".into(),
            project_id: "proj-1".into(),
            dev_environment_id: None,
            title: "no env".into(),
            creator: "alice".into(),
            start_branch: "main".into(),
            workspace_path: String::new(),
            work_branch: "ai/no-env".into(),
            status: TaskStatus::Todo,
            session_id: String::new(),
        };
        repo.seed_fixture(&project, None, None, &task).await.unwrap();
        let conv = due_conversation("conv-1", "task-1");
        repo.update_conversation(&conv).await.unwrap();

        let base_dir = tempdir().unwrap();
        let (executor, execution_manager) = executor_with(repo.clone(), base_dir.path(), 2);

        run_tick(&(repo.clone() as Arc<dyn Repository>), &execution_manager, &executor).await.unwrap();

        let details = repo.get_conversation("conv-1").await.unwrap();
        assert_eq!(details.conversation.status, ConversationStatus::Failed);
        assert!(!execution_manager.is_running("conv-1"));

        // A second tick with nothing new pending stays a no-op: the failed
        // conversation does not resurface as a candidate.
        run_tick(&(repo as Arc<dyn Repository>), &execution_manager, &executor).await.unwrap();
        assert_eq!(execution_manager.running_count(), 0);
    }

    #[tokio::test]
    async fn a_conversation_not_yet_due_is_skipped_this_tick() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let project = Project {
            id: "proj-1".into(),
            repo_url: "https://example.invalid/repo.git".into(),
            protocol: GitProtocol::Https,
            credential_id: None,
        };
        let task = Task {
            id: "task-1".into(),
            project_id: "proj-1".into(),
            dev_environment_id: None,
            title: "future".into(),
            creator: "alice".into(),
            start_branch: "main".into(),
            workspace_path: String::new(),
            work_branch: "ai/future".into(),
            status: TaskStatus::Todo,
            session_id: String::new(),
        };
        repo.seed_fixture(&project, None, None, &task).await.unwrap();
        let mut conv = due_conversation("conv-1", "task-1");
        conv.execution_time = Some(chrono::Utc::now() + chrono::Duration::hours(1));
        repo.update_conversation(&conv).await.unwrap();

        let base_dir = tempdir().unwrap();
        let (executor, execution_manager) = executor_with(repo.clone(), base_dir.path(), 2);

        run_tick(&(repo.clone() as Arc<dyn Repository>), &execution_manager, &executor).await.unwrap();

        let details = repo.get_conversation("conv-1").await.unwrap();
        assert_eq!(details.conversation.status, ConversationStatus::Pending);
        assert!(!execution_manager.is_running("conv-1"));
    }

    #[test]
    fn max_concurrency_is_enforced_before_process_is_ever_called() {
        let mgr = ExecutionManager::new(MaxConcurrency::new(1));
        assert!(mgr.admit("already-running", tokio_util::sync::CancellationToken::new()));
        assert!(!mgr.can_admit());
    }
}

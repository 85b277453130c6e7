//! Conversation Executor.
//!
//! The orchestrator per conversation (spec §4.2): validates pre-conditions,
//! transitions state, drives the Workspace Manager, Credential Materializer,
//! Container Command Builder, and Child Process Supervisor in order, and
//! owns the single deferred reconciliation block that is the one exit path
//! of a background run. Grounded on the teacher's `Server::handle_power_action`
//! shape (validate, transition, spawn a background task, always reconcile
//! state on the way out) generalized from container power transitions to a
//! whole conversation run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcaster::{LineKind, LogBroadcaster};
use crate::container::ContainerCommandBuilder;
use crate::credentials::CredentialMaterializer;
use crate::domain::{
    AssistantResultEvent, ConversationResult, ConversationStatus, ExecutionLog,
    ExecutionLogMetadataUpdate, Task,
};
use crate::execution::SharedExecutionManager;
use crate::repository::{ConversationDetails, Repository};
use crate::supervisor::{ChildProcessSupervisor, StreamLabel};
use crate::workspace::{GitNetworkConfig, WorkspaceManager};

const TASK_CANCELLED_MESSAGE: &str = "task cancelled";

/// A single "(task, conversation, final_status, error_message)" sink. Kept
/// as a trait, injected at construction, the same way the `Repository`
/// boundary is — no setter-based back-wiring between the executor and its
/// collaborators.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        task: &Task,
        conversation_id: &str,
        final_status: ConversationStatus,
        error_message: Option<&str>,
    );
}

/// Logs the notification instead of delivering it anywhere; real deployments
/// supply their own sink (email, webhook) per spec §1's out-of-scope list.
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify(
        &self,
        task: &Task,
        conversation_id: &str,
        final_status: ConversationStatus,
        error_message: Option<&str>,
    ) {
        info!(
            task_id = %task.id,
            conversation_id,
            status = %final_status,
            error = error_message.unwrap_or(""),
            "conversation notification"
        );
    }
}

pub struct ConversationExecutor {
    repository: Arc<dyn Repository>,
    execution_manager: SharedExecutionManager,
    workspace: Arc<WorkspaceManager>,
    credentials: Arc<CredentialMaterializer>,
    container_builder: Arc<ContainerCommandBuilder>,
    supervisor: Arc<ChildProcessSupervisor>,
    broadcaster: LogBroadcaster,
    notifier: Arc<dyn NotificationSink>,
    network: GitNetworkConfig,
    container_timeout: Duration,
    git_clone_timeout: Duration,
}

/// Accumulated over the background stages; never short-circuits with `?` so
/// every path reaches the reconciliation block with a concrete outcome.
struct RunOutcome {
    final_status: ConversationStatus,
    error_message: Option<String>,
    commit_hash: Option<String>,
    workspace_path: Option<PathBuf>,
    result: Option<ConversationResult>,
    session_id: Option<String>,
}

impl RunOutcome {
    fn cancelled(workspace_path: Option<PathBuf>) -> Self {
        Self {
            final_status: ConversationStatus::Cancelled,
            error_message: Some(TASK_CANCELLED_MESSAGE.to_string()),
            commit_hash: None,
            workspace_path,
            result: None,
            session_id: None,
        }
    }

    fn failed(message: impl Into<String>, workspace_path: Option<PathBuf>) -> Self {
        Self {
            final_status: ConversationStatus::Failed,
            error_message: Some(message.into()),
            commit_hash: None,
            workspace_path,
            result: None,
            session_id: None,
        }
    }
}

impl ConversationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn Repository>,
        execution_manager: SharedExecutionManager,
        workspace: Arc<WorkspaceManager>,
        credentials: Arc<CredentialMaterializer>,
        container_builder: Arc<ContainerCommandBuilder>,
        supervisor: Arc<ChildProcessSupervisor>,
        broadcaster: LogBroadcaster,
        notifier: Arc<dyn NotificationSink>,
        network: GitNetworkConfig,
        container_timeout: Duration,
        git_clone_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            execution_manager,
            workspace,
            credentials,
            container_builder,
            supervisor,
            broadcaster,
            notifier,
            network,
            container_timeout,
            git_clone_timeout,
        }
    }

    /// Drives one conversation to a terminal status. Pre-flight and
    /// admission failures are handled inline, synchronously, before this
    /// returns. A successful admission spawns the background run and
    /// returns immediately — the caller does not wait for completion.
    pub async fn process(&self, conversation_id: &str) {
        let details = match self.repository.get_conversation(conversation_id).await {
            Ok(d) => d,
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to load conversation details, failing conversation");
                self.fail_conversation_load_error(conversation_id, &e.to_string()).await;
                return;
            }
        };

        if details.conversation.status != ConversationStatus::Pending {
            return;
        }

        let Some(dev_environment) = details.dev_environment.clone() else {
            self.fail_precondition(&details, "task has no development environment configured").await;
            return;
        };
        if dev_environment.docker_image.is_empty() {
            self.fail_precondition(&details, "development environment has no docker image configured").await;
            return;
        }

        let mut conversation = details.conversation.clone();
        conversation.status = ConversationStatus::Running;
        if let Err(e) = self.repository.update_conversation(&conversation).await {
            warn!(conversation_id, error = %e, "failed to transition conversation to running");
            conversation.status = ConversationStatus::Failed;
            let _ = self.repository.update_conversation(&conversation).await;
            return;
        }

        let log_id = uuid::Uuid::new_v4().to_string();
        let log = ExecutionLog::new(log_id.clone(), conversation_id.to_string());
        if let Err(e) = self.repository.create_execution_log(&log).await {
            warn!(conversation_id, error = %e, "failed to create execution log, rolling back to failed");
            conversation.status = ConversationStatus::Failed;
            let _ = self.repository.update_conversation(&conversation).await;
            return;
        }

        let cancellation = CancellationToken::new();
        if !self.execution_manager.admit(conversation_id, cancellation.clone()) {
            info!(conversation_id, "admission refused, rolling back to pending");
            conversation.status = ConversationStatus::Pending;
            let _ = self.repository.update_conversation(&conversation).await;
            let _ = self
                .repository
                .update_log_metadata(
                    &log_id,
                    ExecutionLogMetadataUpdate {
                        error_message: Some("admission refused: concurrency limit reached".to_string()),
                        ..Default::default()
                    },
                )
                .await;
            return;
        }

        let this = self.clone_handles();
        let details = details;
        let log_id = log_id;
        tokio::spawn(async move {
            this.run_and_reconcile(details, dev_environment, log_id, cancellation).await;
        });
    }

    /// `Repository`/`NotificationSink` trait objects and the other
    /// collaborators are all `Arc`-backed, so a background task gets its own
    /// cheap handle rather than borrowing `self` across an `.await` that
    /// outlives the caller.
    fn clone_handles(&self) -> Arc<Self> {
        Arc::new(Self {
            repository: self.repository.clone(),
            execution_manager: self.execution_manager.clone(),
            workspace: self.workspace.clone(),
            credentials: self.credentials.clone(),
            container_builder: self.container_builder.clone(),
            supervisor: self.supervisor.clone(),
            broadcaster: self.broadcaster.clone(),
            notifier: self.notifier.clone(),
            network: self.network.clone(),
            container_timeout: self.container_timeout,
            git_clone_timeout: self.git_clone_timeout,
        })
    }

    /// Loading the conversation's joined Task/Project/DevEnvironment row
    /// failed (e.g. the task or project it points to has been deleted).
    /// The conversation still exists and must not be left stuck `Pending`,
    /// so mark it failed off the bare row rather than the full join.
    async fn fail_conversation_load_error(&self, conversation_id: &str, message: &str) {
        let mut conversation = match self.repository.get_bare_conversation(conversation_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(conversation_id, error = %e, "failed to load bare conversation row, giving up");
                return;
            }
        };
        if conversation.status != ConversationStatus::Pending {
            return;
        }
        conversation.status = ConversationStatus::Failed;
        if let Err(e) = self.repository.update_conversation(&conversation).await {
            warn!(conversation_id, error = %e, "failed to record conversation load failure");
            return;
        }

        let log_id = uuid::Uuid::new_v4().to_string();
        let mut log = ExecutionLog::new(log_id, conversation_id.to_string());
        log.error_message = Some(message.to_string());
        log.completed_at = Some(Utc::now());
        if let Err(e) = self.repository.create_execution_log(&log).await {
            warn!(conversation_id, error = %e, "failed to record load-failure execution log");
        }
    }

    async fn fail_precondition(&self, details: &ConversationDetails, message: &str) {
        let mut conversation = details.conversation.clone();
        conversation.status = ConversationStatus::Failed;
        if let Err(e) = self.repository.update_conversation(&conversation).await {
            warn!(conversation_id = %conversation.id, error = %e, "failed to record precondition failure");
        }

        let log_id = uuid::Uuid::new_v4().to_string();
        let mut log = ExecutionLog::new(log_id.clone(), conversation.id.clone());
        log.error_message = Some(message.to_string());
        log.completed_at = Some(Utc::now());
        if let Err(e) = self.repository.create_execution_log(&log).await {
            warn!(conversation_id = %conversation.id, error = %e, "failed to record precondition execution log");
        }
    }

    async fn run_and_reconcile(
        self: Arc<Self>,
        details: ConversationDetails,
        dev_environment: crate::domain::DevEnvironment,
        log_id: String,
        cancellation: CancellationToken,
    ) {
        let outcome = self.run_stages(&details, &dev_environment, &log_id, &cancellation).await;
        self.reconcile(details, log_id, outcome).await;
    }

    async fn run_stages(
        &self,
        details: &ConversationDetails,
        dev_environment: &crate::domain::DevEnvironment,
        log_id: &str,
        cancellation: &CancellationToken,
    ) -> RunOutcome {
        let task_id = details.task.id.clone();
        let conversation_id = details.conversation.id.clone();

        // Stage 1: ensure workspace.
        let existing = if details.task.has_workspace() { Some(details.task.workspace_path.as_str()) } else { None };
        let workspace_path = match self.workspace.get_or_create(&task_id, existing) {
            Ok(p) => p,
            Err(e) => return RunOutcome::failed(format!("workspace error: {e}"), None),
        };
        if !details.task.has_workspace() {
            let mut task = details.task.clone();
            let relative = workspace_path
                .strip_prefix(self.workspace.base_dir())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| workspace_path.to_string_lossy().into_owned());
            task.workspace_path = relative;
            if let Err(e) = self.repository.update_task(&task).await {
                warn!(%task_id, error = %e, "failed to persist newly created workspace path");
            }
        }
        if cancellation.is_cancelled() {
            return RunOutcome::cancelled(Some(workspace_path));
        }

        // Stage 2: record started_at.
        let _ = self
            .repository
            .update_log_metadata(
                log_id,
                ExecutionLogMetadataUpdate { started_at: Some(Utc::now()), ..Default::default() },
            )
            .await;

        // Stage 3: ensure repository.
        if !self.workspace.has_repository(&workspace_path).await {
            if cancellation.is_cancelled() {
                return RunOutcome::cancelled(Some(workspace_path));
            }
            let credential = match self.load_credential_secret(&details.project).await {
                Ok(c) => c,
                Err(e) => return RunOutcome::failed(format!("credential error: {e}"), Some(workspace_path)),
            };
            let clone_result = self
                .workspace
                .clone(
                    &workspace_path,
                    &details.project.repo_url,
                    &details.task.start_branch,
                    details.project.protocol,
                    credential.as_ref(),
                    &self.network,
                    cancellation,
                    self.git_clone_timeout,
                )
                .await;
            if let Err(e) = clone_result {
                if matches!(e, crate::workspace::WorkspaceError::Cancelled) {
                    return RunOutcome::cancelled(Some(workspace_path));
                }
                return RunOutcome::failed(format!("clone failed: {e}"), Some(workspace_path));
            }
            if let Err(e) = self
                .workspace
                .create_work_branch_if_missing(&workspace_path, &details.task.work_branch, cancellation)
                .await
            {
                return RunOutcome::failed(format!("work branch creation failed: {e}"), Some(workspace_path));
            }
        }
        if cancellation.is_cancelled() {
            return RunOutcome::cancelled(Some(workspace_path));
        }

        // Stage 4: build command.
        let built = self.container_builder.build(&details.conversation, dev_environment, &workspace_path);
        let log_command = built.log_argv.join(" ");
        let _ = self
            .repository
            .update_log_metadata(
                log_id,
                ExecutionLogMetadataUpdate { docker_command: Some(log_command.clone()), ..Default::default() },
            )
            .await;
        let start_line = format!("start of command: {log_command}");
        let _ = self.repository.append_log_text(log_id, &start_line).await;
        self.broadcaster.broadcast_log(conversation_id.clone(), start_line, LineKind::Log);

        if cancellation.is_cancelled() {
            return RunOutcome::cancelled(Some(workspace_path));
        }

        // Stage 5: run command. The runtime's version probe runs first so an
        // unavailable daemon is classified distinctly from a job failure.
        if let Err(e) = self.supervisor.probe_runtime().await {
            return RunOutcome::failed(e.to_string(), Some(workspace_path));
        }
        let broadcaster = self.broadcaster.clone();
        let repository = self.repository.clone();
        let log_id_owned = log_id.to_string();
        let conversation_id_for_lines = conversation_id.clone();
        let exit = self
            .supervisor
            .run(&built.run_argv, cancellation, self.container_timeout, move |line| {
                let kind = match line.stream {
                    StreamLabel::Stdout => LineKind::Log,
                    StreamLabel::Stderr => LineKind::Error,
                };
                broadcaster.broadcast_log(conversation_id_for_lines.clone(), line.line.clone(), kind);
                let repository = repository.clone();
                let log_id_owned = log_id_owned.clone();
                tokio::spawn(async move {
                    if let Err(e) = repository.append_log_text(&log_id_owned, &line.line).await {
                        warn!(error = %e, "failed to append supervised process output, dropping line");
                    }
                });
            })
            .await;

        let stdout_lines = match exit {
            Ok(exit_result) => exit_result.stdout_lines,
            Err(e) => {
                if matches!(e, crate::supervisor::SupervisorError::Cancelled) {
                    return RunOutcome::cancelled(Some(workspace_path));
                }
                return RunOutcome::failed(e.to_string(), Some(workspace_path));
            }
        };

        // Stage 6: commit changes. A commit failure is a warning, not a
        // conversation failure — the assistant may have done useful work
        // with nothing to stage, or changes are meant for a later run.
        let commit_message = format!("AI generated changes for conversation {conversation_id}");
        let commit_hash = match self.workspace.commit_all(&workspace_path, &commit_message).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(%conversation_id, error = %e, "commit failed, continuing without a commit");
                None
            }
        };

        // Stage 7: parse terminal result, if the assistant emitted one.
        let (result, session_id) = match AssistantResultEvent::find_in_stream(&stdout_lines) {
            Some(event) => {
                let result = ConversationResult {
                    id: uuid::Uuid::new_v4().to_string(),
                    conversation_id: conversation_id.clone(),
                    task_id: task_id.clone(),
                    result_type: AssistantResultEvent::TYPE.to_string(),
                    subtype: event.subtype,
                    is_error: event.is_error,
                    duration_ms: event.duration_ms,
                    duration_api_ms: event.duration_api_ms,
                    num_turns: event.num_turns,
                    result: event.result,
                    session_id: event.session_id.clone(),
                    total_cost_usd: event.total_cost_usd,
                    usage: event.usage,
                };
                (Some(result), Some(event.session_id))
            }
            None => (None, None),
        };

        RunOutcome {
            final_status: ConversationStatus::Success,
            error_message: None,
            commit_hash,
            workspace_path: Some(workspace_path),
            result,
            session_id,
        }
    }

    async fn load_credential_secret(
        &self,
        project: &crate::domain::Project,
    ) -> Result<Option<crate::domain::CredentialSecret>, String> {
        let Some(credential_id) = &project.credential_id else {
            return Ok(None);
        };
        let credential = self
            .repository
            .get_credential(credential_id)
            .await
            .map_err(|e| e.to_string())?;
        let secret = self.credentials.materialize_bundle(&credential).map_err(|e| e.to_string())?;
        Ok(Some(secret))
    }

    /// The single deferred reconciliation block: always runs, in order,
    /// regardless of which stage produced the outcome.
    async fn reconcile(&self, details: ConversationDetails, log_id: String, outcome: RunOutcome) {
        let conversation_id = details.conversation.id.clone();

        // (a) release from the Execution Manager.
        self.execution_manager.release(&conversation_id);

        // (b) write terminal status.
        let mut conversation = details.conversation.clone();
        conversation.status = outcome.final_status;
        if let Err(e) = self.repository.update_conversation(&conversation).await {
            warn!(%conversation_id, error = %e, "failed to persist terminal conversation status");
        }

        // (c) reset the workspace on failure or cancellation.
        if matches!(outcome.final_status, ConversationStatus::Failed | ConversationStatus::Cancelled) {
            if let Some(path) = &outcome.workspace_path {
                if let Err(e) = self.workspace.reset_to_clean(path).await {
                    warn!(%conversation_id, error = %e, "failed to reset workspace after non-success run");
                }
            }
        }

        // (d) update ExecutionLog metadata, never the appended log text.
        if let Err(e) = self
            .repository
            .update_log_metadata(
                &log_id,
                ExecutionLogMetadataUpdate {
                    completed_at: Some(Utc::now()),
                    error_message: outcome.error_message.clone(),
                    commit_hash: outcome.commit_hash.clone(),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(%conversation_id, error = %e, "failed to persist execution log metadata");
        }

        // Result + session id bookkeeping (part of stage 7, persisted here
        // alongside the rest of the terminal metadata).
        if let Some(result) = &outcome.result {
            if let Err(e) = self.repository.create_conversation_result(result).await {
                warn!(%conversation_id, error = %e, "failed to persist conversation result");
            }
        }
        if let Some(session_id) = &outcome.session_id {
            let mut task = details.task.clone();
            task.session_id = session_id.clone();
            if let Err(e) = self.repository.update_task(&task).await {
                warn!(task_id = %details.task.id, error = %e, "failed to persist task session id");
            }
        }

        // (e) broadcast a terminal status line.
        self.broadcaster.broadcast_status(conversation_id.clone(), outcome.final_status.to_string());

        // (f) invoke the notification sink.
        self.notifier
            .notify(&details.task, &conversation_id, outcome.final_status, outcome.error_message.as_deref())
            .await;
    }
}

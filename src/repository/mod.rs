//! Persistence boundary.
//!
//! The core depends only on the [`Repository`] trait (spec §6); [`sqlite`]
//! provides the default, testable backing store. Any other store that
//! honors the trait is a drop-in replacement.

mod sqlite;

pub use sqlite::SqliteRepository;

use async_trait::async_trait;

use crate::domain::{
    Conversation, ConversationResult, DevEnvironment, ExecutionLog, ExecutionLogMetadataUpdate,
    Project, Task,
};
use crate::error::RepositoryError;

pub type RepoResult<T> = Result<T, RepositoryError>;

/// A conversation joined with the entities its execution depends on.
/// Loading these together at admission time is what lets `PreconditionMissing`
/// be detected before any background work starts.
#[derive(Debug, Clone)]
pub struct ConversationDetails {
    pub conversation: Conversation,
    pub task: Task,
    pub project: Project,
    pub dev_environment: Option<DevEnvironment>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn get_conversation(&self, id: &str) -> RepoResult<ConversationDetails>;
    /// The bare conversation row, with none of its related entities joined.
    /// Used when `get_conversation` itself fails (e.g. the task or project it
    /// points to has been deleted) and the caller still needs to mark the
    /// conversation failed rather than leave it stuck pending.
    async fn get_bare_conversation(&self, id: &str) -> RepoResult<Conversation>;
    async fn list_pending_with_details(&self) -> RepoResult<Vec<ConversationDetails>>;
    async fn update_conversation(&self, conv: &Conversation) -> RepoResult<()>;
    async fn has_pending_or_running(&self, task_id: &str) -> RepoResult<bool>;
    async fn get_latest_conversation(&self, task_id: &str) -> RepoResult<Option<Conversation>>;
    async fn delete_conversation(&self, id: &str) -> RepoResult<()>;

    async fn create_execution_log(&self, log: &ExecutionLog) -> RepoResult<()>;
    async fn append_log_text(&self, id: &str, line: &str) -> RepoResult<()>;
    async fn update_log_metadata(
        &self,
        id: &str,
        update: ExecutionLogMetadataUpdate,
    ) -> RepoResult<()>;
    async fn delete_logs_by_conversation(&self, conversation_id: &str) -> RepoResult<()>;

    async fn create_conversation_result(&self, result: &ConversationResult) -> RepoResult<()>;
    async fn get_latest_result_by_task(
        &self,
        task_id: &str,
    ) -> RepoResult<Option<ConversationResult>>;
    async fn delete_results_by_conversation(&self, conversation_id: &str) -> RepoResult<()>;

    async fn get_task(&self, id: &str) -> RepoResult<Task>;
    async fn update_task(&self, task: &Task) -> RepoResult<()>;

    async fn get_project(&self, id: &str) -> RepoResult<Project>;
    async fn get_dev_environment(&self, id: &str) -> RepoResult<DevEnvironment>;
    async fn get_credential(&self, id: &str) -> RepoResult<crate::domain::Credential>;
}

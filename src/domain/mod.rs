//! Core entities shared by every component of the execution engine.
//!
//! These types are intentionally plain data — behavior lives in the
//! components that operate on them (`executor`, `workspace`, `container`, ...).

mod conversation;
mod credential;
mod dev_environment;
mod execution_log;
mod project;
mod task;

pub use conversation::{AssistantResultEvent, Conversation, ConversationResult, ConversationStatus, EnvParams};
pub use credential::{Credential, CredentialKind, CredentialSecret};
pub use dev_environment::DevEnvironment;
pub use execution_log::{ExecutionLog, ExecutionLogMetadataUpdate};
pub use project::{GitProtocol, Project};
pub use task::{Task, TaskStatus};

/// A fully resolved, in-memory description of the container runtime invocation
/// a single conversation is about to produce. Never persisted as-is; the
/// log-safe rendering of its `log_argv` is what gets written to the
/// [`ExecutionLog`].
#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    pub conversation_id: String,
    pub workspace_path: std::path::PathBuf,
    pub run_argv: Vec<String>,
    pub log_argv: Vec<String>,
    pub deadline: std::time::Duration,
}

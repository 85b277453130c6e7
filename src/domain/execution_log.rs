use serde::{Deserialize, Serialize};

/// Exactly one record per conversation attempt. The appended log text is
/// write-only from the executor's perspective (append_text); the metadata
/// fields are updated separately by the reconciliation block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: String,
    pub conversation_id: String,
    pub log_text: String,
    pub docker_command: String,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
    pub commit_hash: Option<String>,
}

impl ExecutionLog {
    pub fn new(id: String, conversation_id: String) -> Self {
        Self {
            id,
            conversation_id,
            log_text: String::new(),
            docker_command: String::new(),
            started_at: None,
            completed_at: None,
            error_message: None,
            commit_hash: None,
        }
    }
}

/// Partial update applied to an `ExecutionLog`'s metadata fields. Fields left
/// as `None` are left untouched; the log text itself is never touched here.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLogMetadataUpdate {
    pub docker_command: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
    pub commit_hash: Option<String>,
}

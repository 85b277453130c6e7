use serde::{Deserialize, Serialize};

/// Status of a [`Task`] — the persistent workspace/branch pair a sequence of
/// conversations accumulates against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A unit of work against one project on one start branch, using one dev
/// environment. Owns a workspace directory and a deterministic work branch,
/// both interned on first execution and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub dev_environment_id: Option<String>,
    pub title: String,
    pub creator: String,
    pub start_branch: String,
    /// Relative to the configured workspace base directory. Empty until the
    /// first conversation executes; immutable once set.
    pub workspace_path: String,
    /// Deterministic name derived from `title` + `creator`; immutable once set.
    pub work_branch: String,
    pub status: TaskStatus,
    pub session_id: String,
}

impl Task {
    /// The deterministic work branch name for a task, derived from its title
    /// and creator. Computed once and interned onto the record; calling this
    /// again must be idempotent so retried task creation doesn't drift.
    pub fn derive_work_branch(title: &str, creator: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(creator.as_bytes());
        hasher.update(b"\0");
        hasher.update(title.as_bytes());
        let digest = hasher.finalize();
        let slug: String = title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        let slug = slug.trim_matches('-');
        let slug = if slug.is_empty() { "task" } else { slug };
        let slug: String = slug.chars().take(40).collect();
        format!("ai/{slug}-{}", hex::encode(&digest[..4]))
    }

    pub fn has_workspace(&self) -> bool {
        !self.workspace_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_branch_is_deterministic() {
        let a = Task::derive_work_branch("Add README", "alice");
        let b = Task::derive_work_branch("Add README", "alice");
        assert_eq!(a, b);
    }

    #[test]
    fn work_branch_differs_by_creator() {
        let a = Task::derive_work_branch("Add README", "alice");
        let b = Task::derive_work_branch("Add README", "bob");
        assert_ne!(a, b);
    }

    #[test]
    fn work_branch_is_slug_safe() {
        let b = Task::derive_work_branch("Fix: login / logout!!", "alice");
        assert!(b.starts_with("ai/fix--login---logout"));
    }
}

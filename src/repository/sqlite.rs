//! SQLite-backed [`Repository`] implementation.
//!
//! Mirrors the teacher daemon's `database` module: a single connection
//! behind a `tokio::sync::Mutex`, WAL mode, and a schema created on open.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::info;

use super::{ConversationDetails, RepoResult, Repository};
use crate::domain::{
    Conversation, ConversationResult, ConversationStatus, Credential, CredentialKind,
    DevEnvironment, ExecutionLog, ExecutionLogMetadataUpdate, GitProtocol, Project, Task,
    TaskStatus,
};
use crate::error::RepositoryError;

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_schema(&conn)?;
        info!(path = %path.display(), "opened sqlite repository");
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> RepoResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                repo_url TEXT NOT NULL,
                protocol TEXT NOT NULL,
                credential_id TEXT
            );

            CREATE TABLE IF NOT EXISTS dev_environments (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                docker_image TEXT NOT NULL,
                cpu_limit REAL NOT NULL,
                memory_limit INTEGER NOT NULL,
                env_vars TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                username TEXT NOT NULL,
                encrypted_secret BLOB NOT NULL,
                public_key TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                dev_environment_id TEXT,
                title TEXT NOT NULL,
                creator TEXT NOT NULL,
                start_branch TEXT NOT NULL,
                workspace_path TEXT NOT NULL,
                work_branch TEXT NOT NULL,
                status TEXT NOT NULL,
                session_id TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                content TEXT NOT NULL,
                attachments TEXT NOT NULL,
                execution_time INTEGER,
                env_params TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_task ON conversations(task_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_task_status ON conversations(task_id, status);

            CREATE TABLE IF NOT EXISTS execution_logs (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                log_text TEXT NOT NULL,
                docker_command TEXT NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                error_message TEXT,
                commit_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_execution_logs_conversation ON execution_logs(conversation_id);

            CREATE TABLE IF NOT EXISTS conversation_results (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                result_type TEXT NOT NULL,
                subtype TEXT NOT NULL,
                is_error INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                duration_api_ms INTEGER NOT NULL,
                num_turns INTEGER NOT NULL,
                result TEXT NOT NULL,
                session_id TEXT NOT NULL,
                total_cost_usd REAL NOT NULL,
                usage TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_results_task ON conversation_results(task_id, id);
            "#,
        )
    }
}

fn to_epoch(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn protocol_to_str(p: GitProtocol) -> &'static str {
    match p {
        GitProtocol::Https => "https",
        GitProtocol::Ssh => "ssh",
    }
}

fn protocol_from_str(s: &str) -> RepoResult<GitProtocol> {
    match s {
        "https" => Ok(GitProtocol::Https),
        "ssh" => Ok(GitProtocol::Ssh),
        other => Err(RepositoryError::Storage(format!("unknown protocol {other}"))),
    }
}

fn credential_kind_to_str(k: CredentialKind) -> &'static str {
    match k {
        CredentialKind::Password => "password",
        CredentialKind::Token => "token",
        CredentialKind::SshKey => "ssh_key",
    }
}

fn credential_kind_from_str(s: &str) -> RepoResult<CredentialKind> {
    match s {
        "password" => Ok(CredentialKind::Password),
        "token" => Ok(CredentialKind::Token),
        "ssh_key" => Ok(CredentialKind::SshKey),
        other => Err(RepositoryError::Storage(format!("unknown credential kind {other}"))),
    }
}

fn task_status_to_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Todo => "todo",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Done => "done",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn task_status_from_str(s: &str) -> RepoResult<TaskStatus> {
    match s {
        "todo" => Ok(TaskStatus::Todo),
        "in_progress" => Ok(TaskStatus::InProgress),
        "done" => Ok(TaskStatus::Done),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(RepositoryError::Storage(format!("unknown task status {other}"))),
    }
}

fn conv_status_to_str(s: ConversationStatus) -> &'static str {
    match s {
        ConversationStatus::Pending => "pending",
        ConversationStatus::Running => "running",
        ConversationStatus::Success => "success",
        ConversationStatus::Failed => "failed",
        ConversationStatus::Cancelled => "cancelled",
    }
}

fn conv_status_from_str(s: &str) -> RepoResult<ConversationStatus> {
    match s {
        "pending" => Ok(ConversationStatus::Pending),
        "running" => Ok(ConversationStatus::Running),
        "success" => Ok(ConversationStatus::Success),
        "failed" => Ok(ConversationStatus::Failed),
        "cancelled" => Ok(ConversationStatus::Cancelled),
        other => Err(RepositoryError::Storage(format!("unknown conversation status {other}"))),
    }
}

fn row_to_project(row: &rusqlite::Row) -> rusqlite::Result<(String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<RawTask> {
    Ok(RawTask {
        id: row.get(0)?,
        project_id: row.get(1)?,
        dev_environment_id: row.get(2)?,
        title: row.get(3)?,
        creator: row.get(4)?,
        start_branch: row.get(5)?,
        workspace_path: row.get(6)?,
        work_branch: row.get(7)?,
        status: row.get(8)?,
        session_id: row.get(9)?,
    })
}

struct RawTask {
    id: String,
    project_id: String,
    dev_environment_id: Option<String>,
    title: String,
    creator: String,
    start_branch: String,
    workspace_path: String,
    work_branch: String,
    status: String,
    session_id: String,
}

impl RawTask {
    fn into_task(self) -> RepoResult<Task> {
        Ok(Task {
            id: self.id,
            project_id: self.project_id,
            dev_environment_id: self.dev_environment_id,
            title: self.title,
            creator: self.creator,
            start_branch: self.start_branch,
            workspace_path: self.workspace_path,
            work_branch: self.work_branch,
            status: task_status_from_str(&self.status)?,
            session_id: self.session_id,
        })
    }
}

struct RawConversation {
    id: String,
    task_id: String,
    content: String,
    attachments: String,
    execution_time: Option<i64>,
    env_params: String,
    status: String,
    created_at: i64,
}

impl RawConversation {
    fn into_conversation(self) -> RepoResult<Conversation> {
        let attachments: Vec<String> = serde_json::from_str(&self.attachments)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let env_params: serde_json::Value = serde_json::from_str(&self.env_params)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        Ok(Conversation {
            id: self.id,
            task_id: self.task_id,
            content: self.content,
            attachments,
            execution_time: self.execution_time.map(from_epoch),
            env_params,
            status: conv_status_from_str(&self.status)?,
            created_at: from_epoch(self.created_at),
        })
    }
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<RawConversation> {
    Ok(RawConversation {
        id: row.get(0)?,
        task_id: row.get(1)?,
        content: row.get(2)?,
        attachments: row.get(3)?,
        execution_time: row.get(4)?,
        env_params: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn get_conversation(&self, id: &str) -> RepoResult<ConversationDetails> {
        let conn = self.conn.lock().await;
        let raw: RawConversation = conn
            .query_row(
                "SELECT id, task_id, content, attachments, execution_time, env_params, status, created_at
                 FROM conversations WHERE id = ?1",
                [id],
                row_to_conversation,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {id}")))?;
        let conversation = raw.into_conversation()?;

        let raw_task: RawTask = conn
            .query_row(
                "SELECT id, project_id, dev_environment_id, title, creator, start_branch,
                        workspace_path, work_branch, status, session_id
                 FROM tasks WHERE id = ?1",
                [&conversation.task_id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("task {}", conversation.task_id)))?;
        let task = raw_task.into_task()?;

        let (_, repo_url, protocol, credential_id) = conn
            .query_row(
                "SELECT id, repo_url, protocol, credential_id FROM projects WHERE id = ?1",
                [&task.project_id],
                row_to_project,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("project {}", task.project_id)))?;
        let project = Project {
            id: task.project_id.clone(),
            repo_url,
            protocol: protocol_from_str(&protocol)?,
            credential_id,
        };

        let dev_environment = match &task.dev_environment_id {
            Some(dev_id) => conn
                .query_row(
                    "SELECT id, kind, docker_image, cpu_limit, memory_limit, env_vars
                     FROM dev_environments WHERE id = ?1",
                    [dev_id],
                    |row| {
                        let env_vars: String = row.get(5)?;
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, f64>(3)?,
                            row.get::<_, i64>(4)?,
                            env_vars,
                        ))
                    },
                )
                .optional()?
                .map(|(id, kind, docker_image, cpu_limit, memory_limit, env_vars)| {
                    Ok::<_, RepositoryError>(DevEnvironment {
                        id,
                        kind,
                        docker_image,
                        cpu_limit,
                        memory_limit: memory_limit as u64,
                        env_vars: serde_json::from_str(&env_vars)
                            .map_err(|e| RepositoryError::Storage(e.to_string()))?,
                    })
                })
                .transpose()?,
            None => None,
        };

        Ok(ConversationDetails { conversation, task, project, dev_environment })
    }

    async fn get_bare_conversation(&self, id: &str) -> RepoResult<Conversation> {
        let conn = self.conn.lock().await;
        let raw: RawConversation = conn
            .query_row(
                "SELECT id, task_id, content, attachments, execution_time, env_params, status, created_at
                 FROM conversations WHERE id = ?1",
                [id],
                row_to_conversation,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("conversation {id}")))?;
        raw.into_conversation()
    }

    async fn list_pending_with_details(&self) -> RepoResult<Vec<ConversationDetails>> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT id FROM conversations WHERE status = 'pending' ORDER BY created_at ASC",
            )?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_conversation(&id).await?);
        }
        Ok(out)
    }

    async fn update_conversation(&self, conv: &Conversation) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        let attachments = serde_json::to_string(&conv.attachments)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        let env_params = serde_json::to_string(&conv.env_params)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO conversations
                (id, task_id, content, attachments, execution_time, env_params, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                task_id = excluded.task_id,
                content = excluded.content,
                attachments = excluded.attachments,
                execution_time = excluded.execution_time,
                env_params = excluded.env_params,
                status = excluded.status,
                created_at = excluded.created_at",
            params![
                conv.id,
                conv.task_id,
                conv.content,
                attachments,
                conv.execution_time.map(to_epoch),
                env_params,
                conv_status_to_str(conv.status),
                to_epoch(conv.created_at),
            ],
        )?;
        Ok(())
    }

    async fn has_pending_or_running(&self, task_id: &str) -> RepoResult<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE task_id = ?1 AND status IN ('pending', 'running')",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    async fn get_latest_conversation(&self, task_id: &str) -> RepoResult<Option<Conversation>> {
        let conn = self.conn.lock().await;
        let raw: Option<RawConversation> = conn
            .query_row(
                "SELECT id, task_id, content, attachments, execution_time, env_params, status, created_at
                 FROM conversations WHERE task_id = ?1 ORDER BY created_at DESC LIMIT 1",
                [task_id],
                row_to_conversation,
            )
            .optional()?;
        raw.map(|r| r.into_conversation()).transpose()
    }

    async fn delete_conversation(&self, id: &str) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        Ok(())
    }

    async fn create_execution_log(&self, log: &ExecutionLog) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO execution_logs
                (id, conversation_id, log_text, docker_command, started_at, completed_at, error_message, commit_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.id,
                log.conversation_id,
                log.log_text,
                log.docker_command,
                log.started_at.map(to_epoch),
                log.completed_at.map(to_epoch),
                log.error_message,
                log.commit_hash,
            ],
        )?;
        Ok(())
    }

    async fn append_log_text(&self, id: &str, line: &str) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE execution_logs SET log_text = log_text || ?2 || char(10) WHERE id = ?1",
            params![id, line],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("execution log {id}")));
        }
        Ok(())
    }

    async fn update_log_metadata(
        &self,
        id: &str,
        update: ExecutionLogMetadataUpdate,
    ) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE execution_logs SET
                docker_command = COALESCE(?2, docker_command),
                started_at = COALESCE(?3, started_at),
                completed_at = COALESCE(?4, completed_at),
                error_message = COALESCE(?5, error_message),
                commit_hash = COALESCE(?6, commit_hash)
             WHERE id = ?1",
            params![
                id,
                update.docker_command,
                update.started_at.map(to_epoch),
                update.completed_at.map(to_epoch),
                update.error_message,
                update.commit_hash,
            ],
        )?;
        Ok(())
    }

    async fn delete_logs_by_conversation(&self, conversation_id: &str) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM execution_logs WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(())
    }

    async fn create_conversation_result(&self, result: &ConversationResult) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        let usage = serde_json::to_string(&result.usage)
            .map_err(|e| RepositoryError::Storage(e.to_string()))?;
        conn.execute(
            "INSERT INTO conversation_results
                (id, conversation_id, task_id, result_type, subtype, is_error, duration_ms,
                 duration_api_ms, num_turns, result, session_id, total_cost_usd, usage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                result.id,
                result.conversation_id,
                result.task_id,
                result.result_type,
                result.subtype,
                result.is_error,
                result.duration_ms,
                result.duration_api_ms,
                result.num_turns,
                result.result,
                result.session_id,
                result.total_cost_usd,
                usage,
            ],
        )?;
        Ok(())
    }

    async fn get_latest_result_by_task(
        &self,
        task_id: &str,
    ) -> RepoResult<Option<ConversationResult>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, conversation_id, task_id, result_type, subtype, is_error, duration_ms,
                        duration_api_ms, num_turns, result, session_id, total_cost_usd, usage
                 FROM conversation_results WHERE task_id = ?1 ORDER BY rowid DESC LIMIT 1",
                [task_id],
                |row| {
                    let usage: String = row.get(12)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, f64>(11)?,
                        usage,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(id, conversation_id, task_id, result_type, subtype, is_error, duration_ms, duration_api_ms, num_turns, result, session_id, total_cost_usd, usage)| {
                Ok(ConversationResult {
                    id,
                    conversation_id,
                    task_id,
                    result_type,
                    subtype,
                    is_error,
                    duration_ms,
                    duration_api_ms,
                    num_turns,
                    result,
                    session_id,
                    total_cost_usd,
                    usage: serde_json::from_str(&usage)
                        .map_err(|e| RepositoryError::Storage(e.to_string()))?,
                })
            },
        )
        .transpose()
    }

    async fn delete_results_by_conversation(&self, conversation_id: &str) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM conversation_results WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> RepoResult<Task> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT id, project_id, dev_environment_id, title, creator, start_branch,
                        workspace_path, work_branch, status, session_id
                 FROM tasks WHERE id = ?1",
                [id],
                row_to_task,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("task {id}")))?;
        raw.into_task()
    }

    async fn update_task(&self, task: &Task) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks
                (id, project_id, dev_environment_id, title, creator, start_branch,
                 workspace_path, work_branch, status, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                dev_environment_id = excluded.dev_environment_id,
                title = excluded.title,
                creator = excluded.creator,
                start_branch = excluded.start_branch,
                workspace_path = excluded.workspace_path,
                work_branch = excluded.work_branch,
                status = excluded.status,
                session_id = excluded.session_id",
            params![
                task.id,
                task.project_id,
                task.dev_environment_id,
                task.title,
                task.creator,
                task.start_branch,
                task.workspace_path,
                task.work_branch,
                task_status_to_str(task.status),
                task.session_id,
            ],
        )?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> RepoResult<Project> {
        let conn = self.conn.lock().await;
        let (_, repo_url, protocol, credential_id) = conn
            .query_row(
                "SELECT id, repo_url, protocol, credential_id FROM projects WHERE id = ?1",
                [id],
                row_to_project,
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("project {id}")))?;
        Ok(Project {
            id: id.to_string(),
            repo_url,
            protocol: protocol_from_str(&protocol)?,
            credential_id,
        })
    }

    async fn get_dev_environment(&self, id: &str) -> RepoResult<DevEnvironment> {
        let conn = self.conn.lock().await;
        let (kind, docker_image, cpu_limit, memory_limit, env_vars): (String, String, f64, i64, String) = conn
            .query_row(
                "SELECT kind, docker_image, cpu_limit, memory_limit, env_vars
                 FROM dev_environments WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("dev environment {id}")))?;
        Ok(DevEnvironment {
            id: id.to_string(),
            kind,
            docker_image,
            cpu_limit,
            memory_limit: memory_limit as u64,
            env_vars: serde_json::from_str(&env_vars)
                .map_err(|e| RepositoryError::Storage(e.to_string()))?,
        })
    }

    async fn get_credential(&self, id: &str) -> RepoResult<Credential> {
        let conn = self.conn.lock().await;
        let (kind, username, encrypted_secret, public_key): (String, String, Vec<u8>, Option<String>) = conn
            .query_row(
                "SELECT kind, username, encrypted_secret, public_key FROM credentials WHERE id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound(format!("credential {id}")))?;
        Ok(Credential {
            id: id.to_string(),
            kind: credential_kind_from_str(&kind)?,
            username,
            encrypted_secret,
            public_key,
        })
    }
}

/// Raw fixture seeding for integration tests in other modules (the executor
/// exercises a full task/project/dev-environment tree against a real
/// repository rather than a hand-rolled mock).
#[cfg(test)]
impl SqliteRepository {
    pub async fn seed_fixture(
        &self,
        project: &Project,
        dev_environment: Option<&DevEnvironment>,
        credential: Option<&Credential>,
        task: &Task,
    ) -> RepoResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, repo_url, protocol, credential_id) VALUES (?1, ?2, ?3, ?4)",
            params![project.id, project.repo_url, protocol_to_str(project.protocol), project.credential_id],
        )?;
        if let Some(dev_environment) = dev_environment {
            conn.execute(
                "INSERT INTO dev_environments (id, kind, docker_image, cpu_limit, memory_limit, env_vars)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    dev_environment.id,
                    dev_environment.kind,
                    dev_environment.docker_image,
                    dev_environment.cpu_limit,
                    dev_environment.memory_limit as i64,
                    serde_json::to_string(&dev_environment.env_vars)
                        .map_err(|e| RepositoryError::Storage(e.to_string()))?,
                ],
            )?;
        }
        if let Some(credential) = credential {
            conn.execute(
                "INSERT INTO credentials (id, kind, username, encrypted_secret, public_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    credential.id,
                    credential_kind_to_str(credential.kind),
                    credential.username,
                    credential.encrypted_secret,
                    credential.public_key,
                ],
            )?;
        }
        conn.execute(
            "INSERT INTO tasks (id, project_id, dev_environment_id, title, creator, start_branch,
                                workspace_path, work_branch, status, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id,
                task.project_id,
                task.dev_environment_id,
                task.title,
                task.creator,
                task.start_branch,
                task.workspace_path,
                task.work_branch,
                task_status_to_str(task.status),
                task.session_id,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sample_project(repo: &SqliteRepository) {
        let conn = repo.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, repo_url, protocol, credential_id) VALUES (?1, ?2, ?3, ?4)",
            params!["proj-1", "https://example.com/repo.git", "https", Option::<String>::None],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO dev_environments (id, kind, docker_image, cpu_limit, memory_limit, env_vars)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params!["dev-1", "claude-code", "ghcr.io/example/claude:latest", 1.0_f64, 1024_i64, "{}"],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project_id, dev_environment_id, title, creator, start_branch,
                                workspace_path, work_branch, status, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                "task-1", "proj-1", "dev-1", "Fix login", "alice", "main",
                "", "ai/fix-login-abcd", "todo", "sess-1",
            ],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn round_trips_a_conversation_with_details() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        sample_project(&repo).await;

        let conv = Conversation {
            id: "conv-1".into(),
            task_id: "task-1".into(),
            content: "please fix the bug".into(),
            attachments: vec!["file.patch".into()],
            execution_time: None,
            env_params: serde_json::json!({"model": "sonnet"}),
            status: ConversationStatus::Pending,
            created_at: Utc::now(),
        };
        repo.update_conversation(&conv).await.unwrap();

        let details = repo.get_conversation("conv-1").await.unwrap();
        assert_eq!(details.conversation.content, "please fix the bug");
        assert_eq!(details.task.id, "task-1");
        assert_eq!(details.project.repo_url, "https://example.com/repo.git");
        assert!(details.dev_environment.is_some());
    }

    #[tokio::test]
    async fn has_pending_or_running_reflects_status() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        sample_project(&repo).await;
        assert!(!repo.has_pending_or_running("task-1").await.unwrap());

        let conv = Conversation {
            id: "conv-1".into(),
            task_id: "task-1".into(),
            content: "x".into(),
            attachments: vec![],
            execution_time: None,
            env_params: serde_json::json!({}),
            status: ConversationStatus::Running,
            created_at: Utc::now(),
        };
        repo.update_conversation(&conv).await.unwrap();
        assert!(repo.has_pending_or_running("task-1").await.unwrap());
    }

    #[tokio::test]
    async fn execution_log_append_and_metadata_update() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        sample_project(&repo).await;
        let log = ExecutionLog::new("log-1".into(), "conv-1".into());
        repo.create_execution_log(&log).await.unwrap();
        repo.append_log_text("log-1", "line one").await.unwrap();
        repo.append_log_text("log-1", "line two").await.unwrap();

        let update = ExecutionLogMetadataUpdate {
            commit_hash: Some("deadbeef".into()),
            ..Default::default()
        };
        repo.update_log_metadata("log-1", update).await.unwrap();

        let conn = repo.conn.lock().await;
        let (text, commit): (String, Option<String>) = conn
            .query_row(
                "SELECT log_text, commit_hash FROM execution_logs WHERE id = 'log-1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(text.contains("line one"));
        assert!(text.contains("line two"));
        assert_eq!(commit.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn append_log_text_on_missing_log_errors() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let err = repo.append_log_text("does-not-exist", "x").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound(_)));
    }
}

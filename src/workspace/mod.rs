//! Workspace Manager.
//!
//! Owns the on-disk Git working tree for a Task: deterministic path
//! derivation, clone/commit/push/reset, and credential-bearing Git
//! invocations. Wraps the `git` CLI the same way `GitService` wraps it,
//! generalized to the clone/commit/push/reset vocabulary this engine needs.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{CredentialSecret, GitProtocol};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git is not installed or not on PATH")]
    GitNotInstalled,

    #[error("git command failed: {0}")]
    CommandFailed(String),

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Remote access configuration shared by every credentialed Git invocation.
#[derive(Debug, Clone, Default)]
pub struct GitNetworkConfig {
    pub tls_verify: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub no_proxy: Option<String>,
}

#[derive(Debug, Default)]
pub struct RemoteAccess {
    pub can_access: bool,
    pub branches: Option<Vec<String>>,
    pub error_message: Option<String>,
}

/// An ephemeral SSH private key written under a 0700 directory. Removed
/// on drop, so it must be kept alive for the duration of the git
/// invocation that references it via `GIT_SSH_COMMAND` and dropped
/// immediately after, regardless of the invocation's outcome.
struct EphemeralSshKey {
    dir: PathBuf,
    key_path: PathBuf,
}

impl EphemeralSshKey {
    #[cfg(unix)]
    fn write(private_key: &str) -> Result<Self, WorkspaceError> {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("convo-engine-ssh-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;

        let key_path = dir.join("id");
        std::fs::write(&key_path, private_key)?;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Self { dir, key_path })
    }

    fn ssh_command(&self) -> String {
        format!("ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new", self.key_path.display())
    }
}

impl Drop for EphemeralSshKey {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "failed to remove ephemeral ssh key directory");
        }
    }
}

/// The URL/env overlay a single Git invocation needs to authenticate.
/// `_ssh_key` is held only for its `Drop` impl — nothing reads it again
/// once `ssh_command` has been copied into the env list.
#[derive(Default)]
struct ResolvedAuth {
    url: String,
    extra_env: Vec<(&'static str, String)>,
    _ssh_key: Option<EphemeralSshKey>,
}

pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base>/<task_id>/<short_stable_token>`. The token is derived from
    /// the task id alone so a task's workspace path is reproducible without
    /// a repository round trip.
    fn derive_path(&self, task_id: &str) -> PathBuf {
        let digest = Sha256::digest(task_id.as_bytes());
        let token = hex::encode(&digest[..8]);
        self.base_dir.join(task_id).join(token)
    }

    pub fn get_or_create(
        &self,
        task_id: &str,
        existing_relative_path: Option<&str>,
    ) -> Result<PathBuf, WorkspaceError> {
        if let Some(rel) = existing_relative_path {
            if !rel.is_empty() {
                let existing = self.base_dir.join(rel);
                if existing.is_dir() {
                    return Ok(existing);
                }
            }
        }
        let path = self.derive_path(task_id);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        extra_env: &[(&str, &str)],
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<std::process::Output, WorkspaceError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => WorkspaceError::GitNotInstalled,
            _ => WorkspaceError::Io(e),
        })?;

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                let _ = child.kill().await;
                Err(WorkspaceError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                Err(WorkspaceError::Timeout)
            }
            output = child.wait_with_output() => {
                output.map_err(WorkspaceError::Io)
            }
        }
    }

    fn require_success(
        output: &std::process::Output,
        on_failure: impl FnOnce(String) -> WorkspaceError,
    ) -> Result<String, WorkspaceError> {
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(on_failure(stderr))
        }
    }

    pub async fn has_repository(&self, path: &Path) -> bool {
        if !path.join(".git").exists() {
            return false;
        }
        let token = CancellationToken::new();
        self.run_git(&["rev-parse"], Some(path), &[], &token, Duration::from_secs(10))
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn inject_https_userinfo(repo_url: &str, username: &str, secret: &str) -> Result<String, WorkspaceError> {
        let mut url = url::Url::parse(repo_url)
            .map_err(|e| WorkspaceError::CommandFailed(format!("invalid repo url: {e}")))?;
        url.set_username(username)
            .map_err(|_| WorkspaceError::CommandFailed("repo url cannot carry credentials".into()))?;
        url.set_password(Some(secret))
            .map_err(|_| WorkspaceError::CommandFailed("repo url cannot carry credentials".into()))?;
        Ok(url.into())
    }

    fn proxy_env(&self, config: &GitNetworkConfig) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();
        if let Some(v) = &config.http_proxy {
            env.push(("http_proxy", v.clone()));
        }
        if let Some(v) = &config.https_proxy {
            env.push(("https_proxy", v.clone()));
        }
        if let Some(v) = &config.no_proxy {
            env.push(("no_proxy", v.clone()));
        }
        env
    }

    /// Resolve the argv-safe URL and environment overlay for a credentialed
    /// Git invocation. The returned `ResolvedAuth` must live until the `git`
    /// child has exited; dropping it early removes the SSH key file the
    /// child may still be reading.
    fn resolve_auth(
        &self,
        repo_url: &str,
        protocol: GitProtocol,
        credential: Option<&CredentialSecret>,
        network: &GitNetworkConfig,
    ) -> Result<ResolvedAuth, WorkspaceError> {
        let mut extra_env = self.proxy_env(network);

        let (url, ssh_key) = match (protocol, credential) {
            (GitProtocol::Https, Some(CredentialSecret::UsernamePassword { username, password })) => {
                (Self::inject_https_userinfo(repo_url, username, password)?, None)
            }
            (GitProtocol::Https, Some(CredentialSecret::UsernameToken { username, token })) => {
                (Self::inject_https_userinfo(repo_url, username, token)?, None)
            }
            (GitProtocol::Ssh, Some(CredentialSecret::SshKey { private_key, .. })) => {
                #[cfg(unix)]
                {
                    let key = EphemeralSshKey::write(private_key)?;
                    (repo_url.to_string(), Some(key))
                }
                #[cfg(not(unix))]
                {
                    return Err(WorkspaceError::CommandFailed(
                        "ssh credential materialization requires a unix host".into(),
                    ));
                }
            }
            (_, None) => (repo_url.to_string(), None),
            _ => {
                return Err(WorkspaceError::CommandFailed(
                    "credential kind does not match project protocol".into(),
                ))
            }
        };

        if let Some(key) = &ssh_key {
            extra_env.push(("GIT_SSH_COMMAND", key.ssh_command()));
        }

        Ok(ResolvedAuth { url, extra_env, _ssh_key: ssh_key })
    }

    pub async fn clone(
        &self,
        path: &Path,
        repo_url: &str,
        start_branch: &str,
        protocol: GitProtocol,
        credential: Option<&CredentialSecret>,
        network: &GitNetworkConfig,
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), WorkspaceError> {
        std::fs::create_dir_all(path)?;

        let auth = self.resolve_auth(repo_url, protocol, credential, network)?;
        let env_refs: Vec<(&str, &str)> = auth.extra_env.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let ssl_flag = format!("http.sslVerify={}", network.tls_verify);
        let path_str = path
            .to_str()
            .ok_or_else(|| WorkspaceError::CloneFailed("workspace path is not valid UTF-8".into()))?;
        let args = ["-c", &ssl_flag, "clone", "--branch", start_branch, "--single-branch", &auth.url, path_str];

        let output = self.run_git(&args, None, &env_refs, cancellation, timeout).await?;
        Self::require_success(&output, WorkspaceError::CloneFailed)?;

        debug!(path = %path.display(), "workspace cloned");
        Ok(())
    }

    /// Create the deterministic WorkBranch from the current HEAD if it
    /// doesn't already exist locally, and check it out.
    pub async fn create_work_branch_if_missing(
        &self,
        path: &Path,
        work_branch: &str,
        cancellation: &CancellationToken,
    ) -> Result<(), WorkspaceError> {
        let exists = self
            .run_git(
                &["rev-parse", "--verify", "--quiet", work_branch],
                Some(path),
                &[],
                cancellation,
                Duration::from_secs(10),
            )
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);

        let args: &[&str] = if exists { &["checkout", work_branch] } else { &["checkout", "-b", work_branch] };
        let output = self.run_git(args, Some(path), &[], cancellation, Duration::from_secs(10)).await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;
        Ok(())
    }

    pub async fn is_dirty(&self, path: &Path) -> Result<bool, WorkspaceError> {
        let token = CancellationToken::new();
        let output = self
            .run_git(&["status", "--porcelain"], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        let text = Self::require_success(&output, WorkspaceError::CommandFailed)?;
        Ok(!text.is_empty())
    }

    pub async fn reset_to_clean(&self, path: &Path) -> Result<(), WorkspaceError> {
        let token = CancellationToken::new();
        let output = self
            .run_git(&["reset", "--hard", "HEAD"], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;
        let output = self
            .run_git(&["clean", "-fd"], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;
        Ok(())
    }

    pub async fn commit_all(
        &self,
        path: &Path,
        message: &str,
    ) -> Result<Option<String>, WorkspaceError> {
        let token = CancellationToken::new();
        let output = self
            .run_git(&["add", "-A"], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;

        let diff = self
            .run_git(&["diff", "--cached", "--quiet"], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        if diff.status.success() {
            return Ok(None);
        }

        let output = self
            .run_git(&["commit", "-m", message], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;

        let output = self
            .run_git(&["rev-parse", "HEAD"], Some(path), &[], &token, Duration::from_secs(10))
            .await?;
        let hash = Self::require_success(&output, WorkspaceError::CommandFailed)?;
        Ok(Some(hash))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn push(
        &self,
        path: &Path,
        branch: &str,
        repo_url: &str,
        protocol: GitProtocol,
        credential: Option<&CredentialSecret>,
        network: &GitNetworkConfig,
        force: bool,
        cancellation: &CancellationToken,
        timeout: Duration,
    ) -> Result<String, WorkspaceError> {
        // The clone step already configured `origin`; the resolved URL here
        // only needs to carry fresh credentials for this invocation's
        // GIT_SSH_COMMAND / userinfo, not to change the remote itself.
        let auth = self.resolve_auth(repo_url, protocol, credential, network)?;
        let env_refs: Vec<(&str, &str)> = auth.extra_env.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let refspec = format!("HEAD:{branch}");
        let mut args = vec!["push", "origin", &refspec];
        if force {
            args.insert(1, "--force");
        }

        let output = self.run_git(&args, Some(path), &env_refs, cancellation, timeout).await?;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(WorkspaceError::PushFailed(combined));
        }
        Ok(combined)
    }

    pub async fn reset_to_parent(&self, path: &Path, commit_hash: &str) -> Result<(), WorkspaceError> {
        let token = CancellationToken::new();
        let parent_ref = format!("{commit_hash}^");
        let output = self
            .run_git(&["reset", "--hard", &parent_ref], Some(path), &[], &token, Duration::from_secs(30))
            .await?;
        Self::require_success(&output, WorkspaceError::CommandFailed)?;
        Ok(())
    }

    pub async fn delete(&self, path: &Path) -> Result<(), WorkspaceError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::Io(e)),
        }
    }

    pub async fn fetch_branches(
        &self,
        repo_url: &str,
        protocol: GitProtocol,
        credential: Option<&CredentialSecret>,
        network: &GitNetworkConfig,
    ) -> RemoteAccess {
        let auth = match self.resolve_auth(repo_url, protocol, credential, network) {
            Ok(a) => a,
            Err(e) => return RemoteAccess { can_access: false, branches: None, error_message: Some(e.to_string()) },
        };
        let env_refs: Vec<(&str, &str)> = auth.extra_env.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let token = CancellationToken::new();

        let result = self
            .run_git(&["ls-remote", "--heads", &auth.url], None, &env_refs, &token, Duration::from_secs(30))
            .await;
        match result {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout).to_string();
                let branches = text
                    .lines()
                    .filter_map(|line| line.split('\t').nth(1))
                    .filter_map(|r| r.strip_prefix("refs/heads/"))
                    .map(str::to_string)
                    .collect();
                RemoteAccess { can_access: true, branches: Some(branches), error_message: None }
            }
            Ok(output) => RemoteAccess {
                can_access: false,
                branches: None,
                error_message: Some(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            },
            Err(e) => RemoteAccess { can_access: false, branches: None, error_message: Some(e.to_string()) },
        }
    }
}

//! Configuration surface (spec §6).
//!
//! TOML-based, following the teacher's `Configuration::load` pattern:
//! deserialize with per-field defaults, then resolve relative paths against
//! the config file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_workspace_base_dir() -> PathBuf {
    PathBuf::from("./workspaces")
}

fn default_scheduler_interval_secs() -> u64 {
    5
}

fn default_container_execution_timeout_secs() -> u64 {
    30 * 60
}

fn default_git_clone_timeout_secs() -> u64 {
    5 * 60
}

fn default_git_ssl_verify() -> bool {
    true
}

fn default_container_runtime_command() -> String {
    "docker".to_string()
}

/// Mirrors the spec's configuration surface field-for-field. `symmetric_key`
/// is read as a hex string in the file and decoded once at load time so the
/// raw config struct never carries a parse failure past startup.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_workspace_base_dir")]
    pub workspace_base_dir: PathBuf,

    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    #[serde(default = "default_container_execution_timeout_secs")]
    pub container_execution_timeout_secs: u64,

    #[serde(default = "default_git_clone_timeout_secs")]
    pub git_clone_timeout_secs: u64,

    #[serde(default = "default_git_ssl_verify")]
    pub git_ssl_verify: bool,

    #[serde(default)]
    pub git_proxy_http: Option<String>,

    #[serde(default)]
    pub git_proxy_https: Option<String>,

    #[serde(default)]
    pub git_proxy_no_proxy: Option<String>,

    /// Hex-encoded 32-byte AES-256-GCM key for the Credential Materializer.
    /// Always overridden by the `SYMMETRIC_KEY` environment variable when set;
    /// the TOML field exists only as a local-development fallback and must
    /// never hold the real key in a deployed config file.
    #[serde(default)]
    pub symmetric_key: String,

    #[serde(default = "default_container_runtime_command")]
    pub container_runtime_command: String,

    /// Repository backing store; a bare path is opened as a SQLite file.
    pub database_path: PathBuf,
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {path}"))?;
        let mut config: EngineConfig =
            toml::from_str(&content).with_context(|| "failed to parse configuration")?;

        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(Path::to_path_buf)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        if config.workspace_base_dir.is_relative() {
            config.workspace_base_dir = base_dir.join(&config.workspace_base_dir);
        }
        if config.database_path.is_relative() {
            config.database_path = base_dir.join(&config.database_path);
        }

        std::fs::create_dir_all(&config.workspace_base_dir)
            .with_context(|| "failed to create workspace base directory")?;

        if let Ok(env_key) = std::env::var("SYMMETRIC_KEY") {
            config.symmetric_key = env_key;
        }
        if config.symmetric_key.is_empty() {
            anyhow::bail!(
                "symmetric_key is not set: provide it via the SYMMETRIC_KEY environment variable \
                 (the TOML field is a local-development fallback only)"
            );
        }

        Ok(config)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    pub fn container_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.container_execution_timeout_secs)
    }

    pub fn git_clone_timeout(&self) -> Duration {
        Duration::from_secs(self.git_clone_timeout_secs)
    }

    pub fn symmetric_key_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.symmetric_key).with_context(|| "symmetric_key is not valid hex")
    }

    pub fn network_config(&self) -> crate::workspace::GitNetworkConfig {
        crate::workspace::GitNetworkConfig {
            tls_verify: self.git_ssl_verify,
            http_proxy: self.git_proxy_http.clone(),
            https_proxy: self.git_proxy_https.clone(),
            no_proxy: self.git_proxy_no_proxy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_relative_paths_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("engine.toml");
        std::fs::write(
            &config_path,
            r#"
            symmetric_key = "00"
            database_path = "data/engine.db"
            workspace_base_dir = "workspaces"
            "#,
        )
        .unwrap();

        let config = EngineConfig::load(config_path.to_str().unwrap()).unwrap();
        assert_eq!(config.workspace_base_dir, dir.path().join("workspaces"));
        assert_eq!(config.database_path, dir.path().join("data/engine.db"));
        assert_eq!(config.max_concurrent_tasks, 5);
        assert!(config.git_ssl_verify);
    }

    #[test]
    fn symmetric_key_env_var_overrides_toml_value() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("engine.toml");
        std::fs::write(
            &config_path,
            r#"
            symmetric_key = "00"
            database_path = "data/engine.db"
            "#,
        )
        .unwrap();

        // SAFETY: test-only env mutation, no other test in this module reads this var.
        unsafe { std::env::set_var("SYMMETRIC_KEY", "ff".repeat(32)) };
        let config = EngineConfig::load(config_path.to_str().unwrap()).unwrap();
        unsafe { std::env::remove_var("SYMMETRIC_KEY") };

        assert_eq!(config.symmetric_key, "ff".repeat(32));
    }

    #[test]
    fn missing_symmetric_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("engine.toml");
        std::fs::write(&config_path, r#"database_path = "data/engine.db""#).unwrap();

        unsafe { std::env::remove_var("SYMMETRIC_KEY") };
        let err = EngineConfig::load(config_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("symmetric_key"));
    }
}

//! Container Command Builder.
//!
//! Produces the argv the Child Process Supervisor will spawn, plus an
//! identically-shaped "log" argv with environment-variable values masked
//! (spec invariant P4: no secret value may reach `ExecutionLog.docker_command`
//! or a log line).

use crate::domain::{Conversation, DevEnvironment};

const MOUNT_POINT: &str = "/app";
const ENV_VALUE_MASK: &str = "****";

pub struct BuiltCommand {
    pub run_argv: Vec<String>,
    pub log_argv: Vec<String>,
}

pub struct ContainerCommandBuilder {
    runtime_command: String,
}

impl ContainerCommandBuilder {
    pub fn new(runtime_command: impl Into<String>) -> Self {
        Self { runtime_command: runtime_command.into() }
    }

    pub fn build(
        &self,
        conversation: &Conversation,
        dev_environment: &DevEnvironment,
        workspace_path: &std::path::Path,
    ) -> BuiltCommand {
        let mut run = vec![self.runtime_command.clone(), "run".to_string(), "--rm".to_string()];

        run.push("-v".to_string());
        run.push(format!("{}:{}", workspace_path.display(), MOUNT_POINT));

        if dev_environment.cpu_limit > 0.0 {
            run.push(format!("--cpus={:.2}", dev_environment.cpu_limit));
        }
        if dev_environment.memory_limit > 0 {
            run.push(format!("--memory={}m", dev_environment.memory_limit));
        }

        let mut log = run.clone();
        for (key, value) in dev_environment.parsed_env_vars() {
            run.push("-e".to_string());
            run.push(format!("{key}={value}"));
            log.push("-e".to_string());
            log.push(format!("{key}={ENV_VALUE_MASK}"));
        }

        run.push(dev_environment.docker_image.clone());
        log.push(dev_environment.docker_image.clone());

        let tail = self.assistant_tail(conversation, dev_environment);
        run.extend(tail.clone());
        log.extend(tail);

        BuiltCommand { run_argv: run, log_argv: log }
    }

    fn assistant_tail(&self, conversation: &Conversation, dev_environment: &DevEnvironment) -> Vec<String> {
        if !dev_environment.uses_claude_code() {
            return vec![conversation.content.clone()];
        }

        let mut tail = vec![
            "claude".to_string(),
            "-p".to_string(),
            "--output-format=stream-json".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--verbose".to_string(),
        ];

        let env_params = conversation.parsed_env_params();
        if let Some(model) = &env_params.model {
            if model != "default" {
                tail.push("--model".to_string());
                tail.push(model.clone());
            }
        }
        if env_params.is_plan_mode {
            tail.push("--permission-mode=plan".to_string());
        }

        tail.push(conversation.content.clone());
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConversationStatus;
    use chrono::Utc;

    fn conversation(content: &str, env_params: serde_json::Value) -> Conversation {
        Conversation {
            id: "conv-1".into(),
            task_id: "task-1".into(),
            content: content.into(),
            attachments: vec![],
            execution_time: None,
            env_params,
            status: ConversationStatus::Pending,
            created_at: Utc::now(),
        }
    }

    fn dev_env(kind: &str, cpu: f64, mem: u64, vars: serde_json::Value) -> DevEnvironment {
        DevEnvironment {
            id: "dev-1".into(),
            kind: kind.into(),
            docker_image: "ghcr.io/example/claude:latest".into(),
            cpu_limit: cpu,
            memory_limit: mem,
            env_vars: vars,
        }
    }

    #[test]
    fn run_and_log_vectors_share_structure_but_mask_values() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("fix the bug", serde_json::json!({}));
        let env = dev_env(
            "claude-code",
            1.5,
            2048,
            serde_json::json!({"API_KEY": "sk-secret", "REGION": "us-east-1"}),
        );

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));

        assert_eq!(built.run_argv.len(), built.log_argv.len());
        assert!(built.run_argv.iter().any(|a| a == "API_KEY=sk-secret"));
        assert!(!built.log_argv.iter().any(|a| a.contains("sk-secret")));
        assert!(built.log_argv.iter().any(|a| a == "API_KEY=****"));
        assert!(built.run_argv.contains(&"--cpus=1.50".to_string()));
        assert!(built.run_argv.contains(&"--memory=2048m".to_string()));
    }

    #[test]
    fn claude_code_tail_includes_model_and_plan_mode() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("do the thing", serde_json::json!({"model": "opus", "is_plan_mode": true}));
        let env = dev_env("claude-code", 0.0, 0, serde_json::json!({}));

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));

        assert!(built.run_argv.contains(&"--model".to_string()));
        assert!(built.run_argv.contains(&"opus".to_string()));
        assert!(built.run_argv.contains(&"--permission-mode=plan".to_string()));
        assert_eq!(built.run_argv.last(), Some(&"do the thing".to_string()));
    }

    #[test]
    fn default_model_is_not_passed_explicitly() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("x", serde_json::json!({"model": "default"}));
        let env = dev_env("claude-code", 0.0, 0, serde_json::json!({}));

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));
        assert!(!built.run_argv.contains(&"--model".to_string()));
    }

    #[test]
    fn generic_dev_environment_type_falls_back_to_bare_content() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("raw command text", serde_json::json!({}));
        let env = dev_env("generic", 0.0, 0, serde_json::json!({}));

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));
        assert_eq!(built.run_argv.last(), Some(&"raw command text".to_string()));
        assert!(!built.run_argv.iter().any(|a| a == "claude"));
    }

    #[test]
    fn unrecognized_dev_environment_type_still_uses_claude_code() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("raw command text", serde_json::json!({}));
        let env = dev_env("custom-runner", 0.0, 0, serde_json::json!({}));

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));
        assert!(built.run_argv.iter().any(|a| a == "claude"));
    }

    #[test]
    fn zero_resource_limits_are_omitted() {
        let builder = ContainerCommandBuilder::new("docker");
        let conv = conversation("x", serde_json::json!({}));
        let env = dev_env("claude-code", 0.0, 0, serde_json::json!({}));

        let built = builder.build(&conv, &env, std::path::Path::new("/workspaces/task-1"));
        assert!(!built.run_argv.iter().any(|a| a.starts_with("--cpus")));
        assert!(!built.run_argv.iter().any(|a| a.starts_with("--memory")));
    }
}

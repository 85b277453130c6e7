//! Child Process Supervisor.
//!
//! Spawns the container (or Git) invocation, concurrently drains both
//! standard streams line-by-line via a biased `select!` loop — the same
//! shape as a bash-tool runner reading a piped child — and enforces a
//! timeout with a kill escalation on cancellation.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const STDERR_TAIL_BYTES: usize = 1_000;
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("process exited with an error")]
    NonZeroExit { stderr_tail: String },

    #[error("process execution timed out")]
    Timeout,

    #[error("process execution cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLabel {
    Stdout,
    Stderr,
}

/// A single line read from a supervised child, tagged for the Log
/// Broadcaster and ExecutionLog appender.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: StreamLabel,
    pub line: String,
    pub at: chrono::DateTime<Utc>,
}

pub struct ExitResult {
    pub stdout_lines: Vec<String>,
}

pub struct ChildProcessSupervisor {
    runtime_command: String,
}

impl ChildProcessSupervisor {
    pub fn new(runtime_command: impl Into<String>) -> Self {
        Self { runtime_command: runtime_command.into() }
    }

    /// Bounded version probe; absence of a working runtime is fatal with a
    /// distinct classification so operators can tell it apart from a job
    /// failure.
    pub async fn probe_runtime(&self) -> Result<(), SupervisorError> {
        let mut cmd = Command::new(&self.runtime_command);
        cmd.arg("version").stdout(Stdio::null()).stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| SupervisorError::RuntimeUnavailable(e.to_string()))?;
        match tokio::time::timeout(Duration::from_secs(10), child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(SupervisorError::RuntimeUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            )),
            Ok(Err(e)) => Err(SupervisorError::RuntimeUnavailable(e.to_string())),
            Err(_) => Err(SupervisorError::RuntimeUnavailable("version probe timed out".into())),
        }
    }

    /// Run `argv[0] argv[1..]`, streaming every line from both pipes to
    /// `on_line` as it arrives. Returns the full ordered stdout lines (the
    /// assistant-result parser needs to scan the whole stream) plus a
    /// classified error on non-zero exit, timeout, or cancellation.
    pub async fn run(
        &self,
        argv: &[String],
        cancellation: &CancellationToken,
        timeout: Duration,
        mut on_line: impl FnMut(OutputLine),
    ) -> Result<ExitResult, SupervisorError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SupervisorError::RuntimeUnavailable("empty argv".into()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdout = BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let stderr = BufReader::new(child.stderr.take().expect("stderr piped")).lines();
        tokio::pin!(stdout);
        tokio::pin!(stderr);

        let mut stdout_lines = Vec::new();
        let mut stderr_tail: VecDeque<String> = VecDeque::new();
        let mut stderr_tail_bytes = 0usize;

        let mut stdout_done = false;
        let mut stderr_done = false;

        // A single deadline anchored at spawn time, not reset by each line
        // read — `timeout` is an absolute ceiling on the whole run, not an
        // idle timeout.
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    break self.kill_and_classify(&mut child, SupervisorError::Cancelled).await;
                }
                _ = &mut deadline => {
                    break self.kill_and_classify(&mut child, SupervisorError::Timeout).await;
                }
                line = stdout.next_line(), if !stdout_done => match line {
                    Ok(Some(line)) => {
                        on_line(OutputLine { stream: StreamLabel::Stdout, line: line.clone(), at: Utc::now() });
                        stdout_lines.push(line);
                    }
                    Ok(None) => stdout_done = true,
                    Err(e) => {
                        warn!(error = %e, "failed reading child stdout");
                        stdout_done = true;
                    }
                },
                line = stderr.next_line(), if !stderr_done => match line {
                    Ok(Some(line)) => {
                        on_line(OutputLine { stream: StreamLabel::Stderr, line: line.clone(), at: Utc::now() });
                        stderr_tail_bytes += line.len() + 1;
                        stderr_tail.push_back(line);
                        while stderr_tail_bytes > STDERR_TAIL_BYTES {
                            if let Some(dropped) = stderr_tail.pop_front() {
                                stderr_tail_bytes -= dropped.len() + 1;
                            } else {
                                break;
                            }
                        }
                    }
                    Ok(None) => stderr_done = true,
                    Err(e) => {
                        warn!(error = %e, "failed reading child stderr");
                        stderr_done = true;
                    }
                },
                status = child.wait(), if stdout_done && stderr_done => {
                    match status {
                        Ok(status) if status.success() => break Ok(()),
                        Ok(_) => {
                            let tail = Self::clamp_tail(&stderr_tail);
                            break Err(SupervisorError::NonZeroExit { stderr_tail: tail });
                        }
                        Err(e) => break Err(SupervisorError::Io(e)),
                    }
                }
            }
        };

        outcome.map(|()| ExitResult { stdout_lines })
    }

    async fn kill_and_classify(
        &self,
        child: &mut tokio::process::Child,
        classification: SupervisorError,
    ) -> Result<(), SupervisorError> {
        let _ = child.start_kill();
        match tokio::time::timeout(KILL_GRACE_PERIOD, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("child did not exit within grace period after kill, abandoning wait");
            }
        }
        Err(classification)
    }

    fn clamp_tail(lines: &VecDeque<String>) -> String {
        let joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() <= STDERR_TAIL_BYTES {
            joined
        } else {
            let start = joined.len() - STDERR_TAIL_BYTES;
            let mut boundary = start;
            while boundary < joined.len() && !joined.is_char_boundary(boundary) {
                boundary += 1;
            }
            joined[boundary..].to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_lines_in_order() {
        let supervisor = ChildProcessSupervisor::new("docker");
        let argv = vec![
            "bash".to_string(),
            "-c".to_string(),
            "echo one; echo two; echo three".to_string(),
        ];
        let cancellation = CancellationToken::new();
        let mut collected = Vec::new();
        let result = supervisor
            .run(&argv, &cancellation, Duration::from_secs(5), |line| collected.push(line.line))
            .await
            .unwrap();
        assert_eq!(result.stdout_lines, vec!["one", "two", "three"]);
        assert_eq!(collected, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr_tail() {
        let supervisor = ChildProcessSupervisor::new("docker");
        let argv = vec!["bash".to_string(), "-c".to_string(), "echo boom 1>&2; exit 3".to_string()];
        let cancellation = CancellationToken::new();
        let err = supervisor.run(&argv, &cancellation, Duration::from_secs(5), |_| {}).await.unwrap_err();
        match err {
            SupervisorError::NonZeroExit { stderr_tail } => assert!(stderr_tail.contains("boom")),
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_child_and_returns_cancelled() {
        let supervisor = ChildProcessSupervisor::new("docker");
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let cancellation = CancellationToken::new();
        let token = cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = supervisor.run(&argv, &cancellation, Duration::from_secs(30), |_| {}).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Cancelled));
    }

    #[tokio::test]
    async fn timeout_returns_timeout_classification() {
        let supervisor = ChildProcessSupervisor::new("docker");
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let cancellation = CancellationToken::new();
        let err = supervisor
            .run(&argv, &cancellation, Duration::from_millis(50), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout));
    }

    #[tokio::test]
    async fn timeout_is_an_absolute_deadline_not_reset_by_output() {
        // Emits a line every 20ms, far more often than the 150ms deadline;
        // a timeout implemented as an idle timer reset on each line read
        // would never fire here.
        let supervisor = ChildProcessSupervisor::new("docker");
        let argv = vec![
            "bash".to_string(),
            "-c".to_string(),
            "while true; do echo tick; sleep 0.02; done".to_string(),
        ];
        let cancellation = CancellationToken::new();
        let err = supervisor
            .run(&argv, &cancellation, Duration::from_millis(150), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Timeout));
    }
}

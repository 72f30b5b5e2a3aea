//! Shell command plumbing. Every filesystem and container operation in the
//! engine goes through a [`CommandRunner`], which is the single place
//! privileged escalation is applied. No retries happen here; retries live in
//! callers.

use crate::error::EngineError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::process::Command;

pub trait CommandRunner: Send + Sync {
    /// Execute a shell command and return combined stdout+stderr on success.
    /// A non-zero exit yields `EngineError::CommandFailed`.
    fn run(
        &self,
        cmd: &str,
        use_sudo: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>>;
}

/// Runs commands on the local host through `sh -c`, optionally under sudo.
pub struct LocalRunner {
    use_sudo: bool,
    timeout: Duration,
}

impl LocalRunner {
    pub fn new(use_sudo: bool, timeout: Duration) -> Self {
        Self { use_sudo, timeout }
    }

    /// The command line actually handed to the shell. Sudo applies only when
    /// both the runner allows it and the call requests it.
    fn command_line(&self, cmd: &str, use_sudo: bool) -> String {
        if self.use_sudo && use_sudo {
            format!("sudo {cmd}")
        } else {
            cmd.to_string()
        }
    }
}

impl CommandRunner for LocalRunner {
    fn run(
        &self,
        cmd: &str,
        use_sudo: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        let line = self.command_line(cmd, use_sudo);
        let timeout = self.timeout;

        Box::pin(async move {
            tracing::debug!(cmd = %line, "Running command");

            let output = match tokio::time::timeout(
                timeout,
                Command::new("sh").arg("-c").arg(&line).output(),
            )
            .await
            {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(EngineError::Backend(format!(
                        "failed to spawn command {line:?}: {e}"
                    )));
                }
                Err(_) => {
                    return Err(EngineError::Timeout(format!(
                        "command {:?} timed out after {}s",
                        line,
                        timeout.as_secs()
                    )));
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if !output.status.success() {
                return Err(EngineError::CommandFailed {
                    exit_code: output.status.code().unwrap_or(-1),
                    stderr: stderr.trim().to_string(),
                });
            }

            let mut combined = stdout.to_string();
            combined.push_str(&stderr);
            Ok(combined)
        })
    }
}

// ── Test support ───────────────────────────────────────────────

/// Scripted runner for tests: records every command line and replays queued
/// responses. When the queue is empty it answers with an empty string.
#[derive(Default)]
pub struct FakeRunner {
    pub commands: std::sync::Mutex<Vec<String>>,
    responses: std::sync::Mutex<std::collections::VecDeque<Result<String, EngineError>>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ok(&self, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(output.to_string()));
    }

    pub fn push_err(&self, err: EngineError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    pub fn recorded(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl CommandRunner for FakeRunner {
    fn run(
        &self,
        cmd: &str,
        _use_sudo: bool,
    ) -> Pin<Box<dyn Future<Output = Result<String, EngineError>> + Send + '_>> {
        let cmd = cmd.to_string();
        Box::pin(async move {
            self.commands.lock().unwrap().push(cmd);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        })
    }
}

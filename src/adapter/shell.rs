//! Adapter that runs a task's `command` payload field as a child process.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tokio::time::timeout;

use super::{AdapterHealth, TaskAdapter};
use crate::error::AdapterError;
use crate::task::Task;

/// Maximum captured length of stdout and stderr each.
const MAX_OUTPUT_LENGTH: usize = 100_000;

/// Default timeout for a command when the task carries none.
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Deserialize)]
struct ShellPayload {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
}

/// Runs `sh -c <command>` for each task.
///
/// A non-zero exit status is reported as a failed execution. The child is killed
/// when the execution future is dropped, so pool timeouts and forced shutdowns
/// never leak processes.
#[derive(Debug, Clone)]
pub struct ShellAdapter {
    shell: String,
    default_timeout: Duration,
}

impl ShellAdapter {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
        }
    }

    /// Sets the shell binary used to run commands.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the timeout used when the task carries none.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    fn parse_payload(task: &Task) -> Result<ShellPayload, AdapterError> {
        let payload: ShellPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| AdapterError::InvalidTask(format!("payload: {}", e)))?;
        if payload.command.trim().is_empty() {
            return Err(AdapterError::InvalidTask("empty command".to_string()));
        }
        Ok(payload)
    }
}

impl Default for ShellAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_LENGTH {
        return text.into_owned();
    }
    let mut end = MAX_OUTPUT_LENGTH;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[output truncated]", &text[..end])
}

#[async_trait]
impl TaskAdapter for ShellAdapter {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute(&self, task: &Task) -> Result<serde_json::Value, AdapterError> {
        let payload = Self::parse_payload(task)?;
        let limit = task.timeout().unwrap_or(self.default_timeout);

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&payload.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &payload.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| AdapterError::WorkerCrashed(format!("spawn {}: {}", self.shell, e)))?;

        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::Timeout(limit))?
            .map_err(|e| AdapterError::WorkerCrashed(e.to_string()))?;

        let stdout = truncate_output(&output.stdout);
        let stderr = truncate_output(&output.stderr);

        match output.status.code() {
            Some(0) => Ok(json!({
                "exit_code": 0,
                "stdout": stdout,
                "stderr": stderr,
            })),
            Some(code) => Err(AdapterError::Failed(format!(
                "Command exited with code {}: {}",
                code,
                stderr.trim()
            ))),
            None => Err(AdapterError::WorkerCrashed(
                "Command terminated by signal".to_string(),
            )),
        }
    }

    async fn health(&self) -> AdapterHealth {
        match Command::new(&self.shell)
            .arg("-c")
            .arg("true")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) if status.success() => AdapterHealth::healthy(),
            Ok(status) => AdapterHealth::unhealthy(format!("shell probe exited with {}", status)),
            Err(e) => AdapterHealth::unhealthy(format!("shell unavailable: {}", e)),
        }
    }
}

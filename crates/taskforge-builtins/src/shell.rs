use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use taskforge_orchestrator::{
    Capability, Task, Worker, WorkerCategory, WorkerDescriptor, WorkerHealth,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const DANGEROUS_PATTERNS: [&str; 4] = ["rm -rf /", "mkfs", "dd if=", ":(){ :|:& };:"];

/// Runs the payload's `command` through `sh -c`.
///
/// Payload fields: `command` (required) and `timeout_secs` (default 30, max 300).
/// The child is killed when the task is cancelled or times out.
pub struct ShellWorker {
    default_timeout: Duration,
}

impl ShellWorker {
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout.min(Duration::from_secs(MAX_TIMEOUT_SECS));
        self
    }

    pub fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::new("shell", WorkerCategory::General)
            .with_description("Execute a shell command with a timeout")
            .with_capability(Capability::Execution)
            .with_tag("process")
            .with_instances(0, 4)
    }
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Worker for ShellWorker {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value> {
        let command = task
            .payload
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        if command.is_empty() {
            return Err(TaskforgeError::Execution("Empty command".into()));
        }
        if let Some(pattern) = DANGEROUS_PATTERNS.iter().find(|p| command.contains(*p)) {
            warn!(task_id = %task.id, command = %command, "Blocked dangerous command");
            return Err(TaskforgeError::Execution(format!(
                "Command blocked: contains dangerous pattern '{pattern}'"
            )));
        }

        let timeout = task
            .payload
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(|secs| Duration::from_secs(secs.min(MAX_TIMEOUT_SECS)))
            .unwrap_or(self.default_timeout);
        info!(task_id = %task.id, command = %command, timeout_secs = timeout.as_secs(), "Executing shell command");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TaskforgeError::Cancelled(format!("command '{command}' cancelled")));
            }
            result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(TaskforgeError::Timeout(format!(
                        "Command timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            },
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let response = serde_json::json!({
            "exit_code": exit_code,
            "stdout": truncate_output(&String::from_utf8_lossy(&output.stdout), 50_000),
            "stderr": truncate_output(&String::from_utf8_lossy(&output.stderr), 10_000),
        });
        if output.status.success() {
            Ok(response)
        } else {
            Err(TaskforgeError::Execution(response.to_string()))
        }
    }

    async fn health(&self) -> WorkerHealth {
        match tokio::process::Command::new("sh")
            .arg("-c")
            .arg("true")
            .status()
            .await
        {
            Ok(status) if status.success() => WorkerHealth::healthy(),
            Ok(status) => WorkerHealth::degraded(0.2, format!("sh exited with {status}")),
            Err(e) => WorkerHealth::degraded(0.0, format!("sh unavailable: {e}")),
        }
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}

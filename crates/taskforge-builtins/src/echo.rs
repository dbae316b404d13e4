use async_trait::async_trait;
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use taskforge_orchestrator::{Capability, Task, Worker, WorkerCategory, WorkerDescriptor};
use tokio_util::sync::CancellationToken;

/// Returns the task payload as its result.
///
/// An optional `delay_ms` payload field makes it wait first, which is handy
/// for exercising timeouts and cancellation.
#[derive(Default)]
pub struct EchoWorker;

impl EchoWorker {
    pub fn new() -> Self {
        Self
    }

    pub fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::new("echo", WorkerCategory::General)
            .with_description("Return the task payload unchanged")
            .with_capability(Capability::Execution)
            .with_instances(0, 8)
    }
}

#[async_trait]
impl Worker for EchoWorker {
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value> {
        if let Some(delay) = task.payload.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TaskforgeError::Cancelled("echo cancelled".into()));
                }
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }
        Ok(serde_json::to_value(&task.payload)?)
    }
}

use crate::registry::Capability;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use taskforge_core::{ErrorKind, Priority, TaskId, TaskforgeError, TaskforgeResult};
use uuid::Uuid;

/// Opaque key-value payload carried by a task.
pub type Payload = HashMap<String, serde_json::Value>;

/// Lifecycle state of a task.
///
/// `Pending → Queued → Assigned → InProgress → {Completed | Failed | Cancelled}`.
/// States only move forward; a retry creates a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on unmet dependencies.
    Pending,
    /// Dependencies satisfied, waiting in the priority queue.
    Queued,
    /// A worker instance has been reserved.
    Assigned,
    /// The worker is executing the task.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Execution raised, timed out, no worker was available, or a dependency failed.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Ordinal used in flat records.
    pub fn ordinal(self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Assigned => 2,
            TaskStatus::InProgress => 3,
            TaskStatus::Completed => 4,
            TaskStatus::Failed => 5,
            TaskStatus::Cancelled => 6,
        }
    }

    /// Whether the task has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued | Failed | Cancelled)
                | (Queued, Assigned | Failed | Cancelled)
                | (Assigned, InProgress | Failed | Cancelled)
                | (InProgress, Completed | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// What a task asks for: a specific worker kind, or any kind with a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum TaskTarget {
    /// A registered worker kind by name.
    Kind(String),
    /// Any registered kind declaring this capability; resolved at dispatch time.
    Capability(Capability),
}

impl std::fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskTarget::Kind(kind) => write!(f, "{kind}"),
            TaskTarget::Capability(cap) => write!(f, "capability:{cap}"),
        }
    }
}

impl From<&str> for TaskTarget {
    fn from(kind: &str) -> Self {
        TaskTarget::Kind(kind.to_string())
    }
}

impl From<String> for TaskTarget {
    fn from(kind: String) -> Self {
        TaskTarget::Kind(kind)
    }
}

impl From<Capability> for TaskTarget {
    fn from(cap: Capability) -> Self {
        TaskTarget::Capability(cap)
    }
}

/// Everything a caller supplies when submitting a task.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Worker kind or capability to run on.
    pub target: TaskTarget,
    /// Opaque payload handed to the worker.
    pub payload: Payload,
    /// Scheduling tier.
    pub priority: Priority,
    /// Tasks that must complete first.
    pub dependencies: Vec<TaskId>,
    /// Per-task timeout; the scheduler default applies when unset.
    pub timeout: Option<Duration>,
    /// Offer execution and timeout failures to the swarm workflow.
    pub auto_heal: bool,
}

impl SubmitRequest {
    /// Request with an empty payload at [`Priority::Medium`].
    pub fn new(target: impl Into<TaskTarget>) -> Self {
        Self {
            target: target.into(),
            payload: Payload::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            timeout: None,
            auto_heal: false,
        }
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Insert one payload entry.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dependency list.
    pub fn depends_on(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Override the execution timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Opt into automatic failure handling.
    pub fn auto_heal(mut self, enabled: bool) -> Self {
        self.auto_heal = enabled;
        self
    }
}

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: TaskTarget,
    /// Worker kind the task was dispatched to (resolved from the target).
    pub kind: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub payload: Payload,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Worker instance reserved for the task.
    pub assigned_worker: Option<Uuid>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// The failed or cancelled task this one retries.
    #[serde(default)]
    pub attempt_of: Option<TaskId>,
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub auto_heal: bool,
    /// Submission order, used to keep FIFO order inside a priority tier.
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    /// Create a task in [`TaskStatus::Pending`] from a submit request.
    pub fn from_request(request: SubmitRequest, sequence: u64) -> Self {
        let mut dependencies = request.dependencies;
        dependencies.sort();
        dependencies.dedup();
        Self {
            id: Uuid::new_v4(),
            kind: match &request.target {
                TaskTarget::Kind(kind) => Some(kind.clone()),
                TaskTarget::Capability(_) => None,
            },
            target: request.target,
            priority: request.priority,
            payload: request.payload,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            result: None,
            error: None,
            error_kind: None,
            retry_count: 0,
            dependencies,
            attempt_of: None,
            timeout_ms: request.timeout.map(|t| t.as_millis() as u64),
            auto_heal: request.auto_heal,
            sequence,
        }
    }

    /// Move to `next`, stamping start and completion times.
    pub fn transition(&mut self, next: TaskStatus) -> TaskforgeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TaskforgeError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            TaskStatus::InProgress => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Move to [`TaskStatus::Failed`] with a reason and classification.
    pub fn fail(&mut self, reason: impl Into<String>, kind: ErrorKind) -> TaskforgeResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(reason.into());
        self.error_kind = Some(kind);
        Ok(())
    }

    /// Human-readable reason for the current state.
    pub fn reason(&self) -> String {
        match self.status {
            TaskStatus::Pending => format!(
                "waiting on {} dependenc{}",
                self.dependencies.len(),
                if self.dependencies.len() == 1 { "y" } else { "ies" }
            ),
            TaskStatus::Queued => "waiting for a worker instance".to_string(),
            TaskStatus::Assigned => "worker instance reserved".to_string(),
            TaskStatus::InProgress => "executing".to_string(),
            TaskStatus::Completed => "completed successfully".to_string(),
            TaskStatus::Failed => self
                .error
                .clone()
                .unwrap_or_else(|| "failed without a reported error".to_string()),
            TaskStatus::Cancelled => self
                .error
                .clone()
                .unwrap_or_else(|| "cancelled by caller".to_string()),
        }
    }

    /// The worker kind, or the target description when not yet resolved.
    pub fn kind_label(&self) -> String {
        self.kind.clone().unwrap_or_else(|| self.target.to_string())
    }
}

/// Flat record of a task for history sinks and monitoring tools.
///
/// Priority and status are ordinals, timestamps are RFC 3339 strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: String,
    pub priority: u8,
    pub status: u8,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub payload: Payload,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub attempt_of: Option<TaskId>,
}

impl From<&Task> for TaskRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            kind: task.kind_label(),
            priority: task.priority.ordinal(),
            status: task.status.ordinal(),
            created_at: task.created_at.to_rfc3339(),
            started_at: task.started_at.map(|t| t.to_rfc3339()),
            completed_at: task.completed_at.map(|t| t.to_rfc3339()),
            payload: task.payload.clone(),
            result: task.result.clone(),
            error: task.error.clone(),
            retry_count: task.retry_count,
            attempt_of: task.attempt_of,
        }
    }
}

/// Answer to a `status(taskId)` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub task_id: TaskId,
    pub state: TaskStatus,
    pub kind: String,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub reason: String,
    pub retry_count: u32,
}

impl From<&Task> for StatusReport {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            state: task.status,
            kind: task.kind_label(),
            result: task.result.clone(),
            error: task.error.clone(),
            reason: task.reason(),
            retry_count: task.retry_count,
        }
    }
}

/// Acknowledgement of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ack", content = "status", rename_all = "snake_case")]
pub enum CancelAck {
    /// The task had not started and is now cancelled.
    Cancelled,
    /// The task is running; its worker has been signalled to stop.
    CancellationRequested,
    /// The task had already finished.
    AlreadyTerminal(TaskStatus),
}

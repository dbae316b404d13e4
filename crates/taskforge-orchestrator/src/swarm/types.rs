use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use taskforge_core::{FailurePriority, TaskId};
use uuid::Uuid;

/// A failure reported by a worker or an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub priority: FailurePriority,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
    /// Scheduler task that produced this failure, if any.
    #[serde(default)]
    pub source_task: Option<TaskId>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

impl Failure {
    pub fn new(
        error_type: impl Into<String>,
        message: impl Into<String>,
        component: impl Into<String>,
        priority: FailurePriority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_type: error_type.into(),
            message: message.into(),
            component: component.into(),
            priority,
            occurred_at: Utc::now(),
            source_task: None,
            context: HashMap::new(),
        }
    }

    pub fn at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn from_task(mut self, task_id: TaskId) -> Self {
        self.source_task = Some(task_id);
        self
    }
}

/// Duplicates of one failure pattern, aggregated during Collect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureGroup {
    /// Fingerprint of `(error_type, normalized message)`.
    pub id: String,
    pub error_type: String,
    /// Normalized message shared by every member.
    pub signature: String,
    /// First raw message seen for this pattern.
    pub sample_message: String,
    pub failure_ids: Vec<Uuid>,
    pub components: BTreeSet<String>,
    /// Highest declared priority among members.
    pub priority: FailurePriority,
    pub severity: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FailureGroup {
    pub fn size(&self) -> usize {
        self.failure_ids.len()
    }

    /// Component most members point at, used as the recovery target.
    pub fn primary_component(&self) -> String {
        self.components
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Root-cause analysis produced by a debugging worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub group_id: String,
    pub kind: String,
    pub root_cause: String,
    pub confidence: f64,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// A proposed correction for a failure group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub id: Uuid,
    pub group_id: String,
    /// Worker kind that authored the fix; it also runs the tests.
    pub author_kind: String,
    pub description: String,
    pub changes: Vec<String>,
    /// Set once the author's validation accepted the fix.
    #[serde(default)]
    pub validated: bool,
}

impl Fix {
    pub fn new(
        group_id: impl Into<String>,
        author_kind: impl Into<String>,
        description: impl Into<String>,
        changes: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            author_kind: author_kind.into(),
            description: description.into(),
            changes,
            validated: false,
        }
    }
}

/// Result of a worker's own test routine against a fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub fix_id: Uuid,
    pub group_id: String,
    pub kind: String,
    pub verdict: TestVerdict,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Phases of a swarm workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Collect,
    Analyze,
    Assign,
    Debug,
    Correct,
    Test,
    Recover,
    Monitor,
    Report,
    Done,
}

impl std::fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowPhase::Collect => "collect",
            WorkflowPhase::Analyze => "analyze",
            WorkflowPhase::Assign => "assign",
            WorkflowPhase::Debug => "debug",
            WorkflowPhase::Correct => "correct",
            WorkflowPhase::Test => "test",
            WorkflowPhase::Recover => "recover",
            WorkflowPhase::Monitor => "monitor",
            WorkflowPhase::Report => "report",
            WorkflowPhase::Done => "done",
        };
        write!(f, "{s}")
    }
}

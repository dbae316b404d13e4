use super::analysis::AnalysisSummary;
use super::recovery::{RecoveryAction, RecoveryOutcome};
use super::types::{Diagnosis, Failure, FailureGroup, Fix, TestOutcome, TestVerdict, WorkflowPhase};
use crate::worker::WorkerHealth;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Where an assigned failure group goes after consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Debug,
    Correct,
    Recover,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub kind: String,
    pub confidence: f64,
    pub route: Route,
}

/// Everything one workflow run knows. Saved at every phase boundary so a run
/// can be resumed from its last completed phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Next phase to run.
    pub phase: WorkflowPhase,
    /// Phases completed so far, in order.
    pub visited: Vec<WorkflowPhase>,
    pub failures: Vec<Failure>,
    /// Failure ids the Assign phase has handled.
    pub processed: BTreeSet<Uuid>,
    pub engaged_kinds: BTreeSet<String>,
    /// Groups in descending severity.
    pub groups: Vec<FailureGroup>,
    pub analysis: Option<AnalysisSummary>,
    /// Failure id to the worker kind chosen for its group.
    pub consensus: BTreeMap<Uuid, String>,
    /// Group id to its assignment.
    pub assignments: BTreeMap<String, Assignment>,
    /// Groups without a kind above the consensus threshold.
    pub deferred: Vec<String>,
    pub pending_debug: Vec<String>,
    pub pending_correct: Vec<String>,
    pub pending_recover: Vec<String>,
    pub diagnoses: Vec<Diagnosis>,
    pub fixes: Vec<Fix>,
    pub tests: Vec<TestOutcome>,
    /// Recovery actions started but not yet finished, by group id.
    pub in_flight: BTreeMap<String, RecoveryAction>,
    pub recoveries: Vec<RecoveryOutcome>,
    pub health: BTreeMap<String, WorkerHealth>,
    pub health_score: Option<f64>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub timed_out: bool,
}

impl SwarmState {
    pub fn new(failures: Vec<Failure>, context: HashMap<String, serde_json::Value>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            phase: WorkflowPhase::Collect,
            visited: Vec::new(),
            failures,
            processed: BTreeSet::new(),
            engaged_kinds: BTreeSet::new(),
            groups: Vec::new(),
            analysis: None,
            consensus: BTreeMap::new(),
            assignments: BTreeMap::new(),
            deferred: Vec::new(),
            pending_debug: Vec::new(),
            pending_correct: Vec::new(),
            pending_recover: Vec::new(),
            diagnoses: Vec::new(),
            fixes: Vec::new(),
            tests: Vec::new(),
            in_flight: BTreeMap::new(),
            recoveries: Vec::new(),
            health: BTreeMap::new(),
            health_score: None,
            context,
            timed_out: false,
        }
    }

    pub fn group(&self, id: &str) -> Option<&FailureGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn diagnosis(&self, group_id: &str) -> Option<&Diagnosis> {
        self.diagnoses.iter().find(|d| d.group_id == group_id)
    }

    /// A group is resolved by a validated fix whose tests did not fail, or by
    /// a successful recovery.
    pub fn is_resolved(&self, group_id: &str) -> bool {
        let fixed = self
            .fixes
            .iter()
            .filter(|f| f.group_id == group_id && f.validated)
            .any(|fix| {
                !self
                    .tests
                    .iter()
                    .any(|t| t.fix_id == fix.id && t.verdict == TestVerdict::Failed)
            });
        fixed
            || self
                .recoveries
                .iter()
                .any(|r| r.group_id == group_id && r.succeeded())
    }

    pub fn unresolved(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| !self.is_resolved(&g.id))
            .map(|g| g.id.clone())
            .collect()
    }
}

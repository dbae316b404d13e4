use super::analysis::{AnalysisSummary, Trend};
use super::recovery::{RecoveryOutcome, RecoveryStatus};
use super::state::SwarmState;
use super::types::{TestOutcome, TestVerdict, WorkflowPhase};
use crate::config::SwarmConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured summary emitted by the Report phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_failures: usize,
    pub groups: usize,
    pub processed: usize,
    pub assigned: usize,
    /// Groups deferred to monitoring for lack of consensus.
    pub deferred: usize,
    pub diagnosed: usize,
    pub fixes_proposed: usize,
    pub fixes_applied: usize,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub recoveries_attempted: usize,
    pub recoveries_succeeded: usize,
    /// Resolved groups over all groups; 1.0 for an empty batch.
    pub success_rate: f64,
    pub health_score: f64,
    pub timed_out: bool,
    pub phases: Vec<WorkflowPhase>,
    pub analysis: AnalysisSummary,
    pub recoveries: Vec<RecoveryOutcome>,
    pub tests: Vec<TestOutcome>,
    pub unresolved: Vec<String>,
    pub recommendations: Vec<String>,
}

impl WorkflowReport {
    pub fn resolved(&self) -> bool {
        self.unresolved.is_empty() && !self.timed_out
    }
}

pub fn build_report(state: &SwarmState, config: &SwarmConfig) -> WorkflowReport {
    let unresolved = state.unresolved();
    let groups = state.groups.len();
    let success_rate = if groups == 0 {
        1.0
    } else {
        (groups - unresolved.len()) as f64 / groups as f64
    };
    let health_score = state.health_score.unwrap_or(1.0);

    WorkflowReport {
        run_id: state.run_id,
        started_at: state.started_at,
        finished_at: Utc::now(),
        total_failures: state.failures.len(),
        groups,
        processed: state.processed.len(),
        assigned: state.assignments.len(),
        deferred: state.deferred.len(),
        diagnosed: state.diagnoses.len(),
        fixes_proposed: state.fixes.len(),
        fixes_applied: state.fixes.iter().filter(|f| f.validated).count(),
        tests_passed: count_verdict(&state.tests, TestVerdict::Passed),
        tests_failed: count_verdict(&state.tests, TestVerdict::Failed),
        recoveries_attempted: state.recoveries.len(),
        recoveries_succeeded: state.recoveries.iter().filter(|r| r.succeeded()).count(),
        success_rate,
        health_score,
        timed_out: state.timed_out,
        phases: state.visited.clone(),
        analysis: state.analysis.clone().unwrap_or_default(),
        recoveries: state.recoveries.clone(),
        tests: state.tests.clone(),
        recommendations: recommendations(state, config, &unresolved, health_score),
        unresolved,
    }
}

fn count_verdict(tests: &[TestOutcome], verdict: TestVerdict) -> usize {
    tests.iter().filter(|t| t.verdict == verdict).count()
}

/// Derived from what is still wrong; the all-clear line only appears when
/// nothing is.
fn recommendations(
    state: &SwarmState,
    config: &SwarmConfig,
    unresolved: &[String],
    health_score: f64,
) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(analysis) = &state.analysis {
        for cluster in &analysis.clusters {
            if cluster.size >= config.high_frequency_threshold {
                out.push(format!(
                    "High-frequency pattern detected: {} occurred {} times ({}); address the root cause",
                    cluster.error_type, cluster.size, cluster.signature
                ));
            }
            if cluster.trend == Trend::Increasing {
                out.push(format!(
                    "{} failures are increasing; about {:.0} expected in the next window",
                    cluster.error_type, cluster.predicted_next
                ));
            }
        }
    }

    if !state.deferred.is_empty() {
        out.push(format!(
            "{} failure group(s) had no worker above the {:.2} consensus threshold; deferred to monitoring",
            state.deferred.len(),
            config.consensus_threshold
        ));
    }

    for recovery in &state.recoveries {
        match recovery.status {
            RecoveryStatus::Succeeded => {}
            RecoveryStatus::Failed => out.push(format!(
                "Recovery of {} via {} failed after {} attempt(s){}; manual intervention required",
                recovery.target,
                recovery.strategy,
                recovery.attempts,
                if recovery.rolled_back {
                    ", rolled back to snapshot"
                } else {
                    ""
                }
            )),
            RecoveryStatus::RejectedCircuitOpen => out.push(format!(
                "Circuit open for {}; recovery suspended until the cooldown elapses",
                recovery.target
            )),
        }
    }

    for test in state.tests.iter().filter(|t| t.verdict == TestVerdict::Failed) {
        out.push(format!(
            "Fix {} for group {} failed its tests; revise before applying",
            test.fix_id, test.group_id
        ));
    }

    if health_score < config.low_health_threshold {
        out.push(format!(
            "Worker health {health_score:.2} is below {:.2}; inspect degraded workers or scale out",
            config.low_health_threshold
        ));
    }

    if state.timed_out {
        out.push(format!(
            "Workflow timed out during {}; resume run {} to finish",
            state.phase, state.run_id
        ));
    }

    if !unresolved.is_empty() && out.is_empty() {
        out.push(format!(
            "{} failure group(s) remain unresolved; review them manually",
            unresolved.len()
        ));
    }

    if out.is_empty() {
        out.push("All failure groups resolved; keep monitoring".to_string());
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::swarm::collect::collect;
    use crate::swarm::types::Failure;
    use std::collections::HashMap;
    use taskforge_core::FailurePriority;

    #[test]
    fn test_empty_batch_is_clean() {
        let state = SwarmState::new(Vec::new(), HashMap::new());
        let report = build_report(&state, &SwarmConfig::default());
        assert_eq!(report.success_rate, 1.0);
        assert_eq!(
            report.recommendations,
            vec!["All failure groups resolved; keep monitoring".to_string()]
        );
    }

    #[test]
    fn test_unresolved_never_claims_success() {
        let failures = vec![Failure::new("io", "disk full", "fs", FailurePriority::Low)];
        let mut state = SwarmState::new(failures, HashMap::new());
        state.groups = collect(&state.failures);
        let report = build_report(&state, &SwarmConfig::default());
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.unresolved.len(), 1);
        assert!(!report.resolved());
        assert!(report.recommendations[0].contains("remain unresolved"));
    }
}

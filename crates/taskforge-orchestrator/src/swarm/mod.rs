//! Swarm workflow engine.
//!
//! Runs a batch of failures through `Collect -> Analyze -> Assign -> {Debug,
//! Correct, Test} -> Recover -> Monitor -> Report`. Routing between the
//! middle phases depends on what the previous phase produced. Worker calls
//! inside a phase fan out with `join_all`; results are applied to the
//! [`SwarmState`] only after the fan-in, so a phase cut short by the workflow
//! timeout leaves the state at its last boundary.

mod analysis;
mod checkpoint;
mod collect;
mod recovery;
mod report;
mod state;
mod types;

pub use analysis::{analyze, classify_trend, predict_next, AnalysisSummary, Cluster, Trend};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use collect::{collect, fingerprint, normalize_message};
pub use recovery::{
    select_strategy, CircuitBreaker, CircuitBreakerRegistry, CircuitState, RecoveryAction,
    RecoveryManager, RecoveryOutcome, RecoveryStatus, RecoveryStrategy, RetryPolicy,
};
pub use report::{build_report, WorkflowReport};
pub use state::{Assignment, Route, SwarmState};
pub use types::{
    Diagnosis, Failure, FailureGroup, Fix, TestOutcome, TestVerdict, WorkflowPhase,
};

use crate::config::SwarmConfig;
use crate::factory::{WorkerFactory, WorkerHandle};
use crate::history::HistorySink;
use crate::monitor::WorkerMonitor;
use crate::registry::{Capability, WorkerDescriptor};
use crate::worker::{Worker, WorkerHealth};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use taskforge_core::{FailurePriority, TaskforgeError, TaskforgeResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A leased worker instance, handed back to its pool when dropped. Dropping
/// also covers phases abandoned by the workflow timeout.
struct Lease<'a> {
    factory: &'a WorkerFactory,
    worker: Arc<dyn Worker>,
    handle: Option<WorkerHandle>,
}

impl Lease<'_> {
    fn worker(&self) -> &dyn Worker {
        self.worker.as_ref()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.factory.release(handle);
        }
    }
}

/// Debug or correct route for a group that is not taking, or has left, the
/// recovery path. `None` when the kind can do neither.
fn repair_route(priority: FailurePriority, descriptor: &WorkerDescriptor) -> Option<Route> {
    let debugs = descriptor.has_capability(&Capability::Debugging);
    if debugs && priority.weight() >= FailurePriority::High.weight() {
        Some(Route::Debug)
    } else if debugs || descriptor.has_capability(&Capability::Correction) {
        Some(Route::Correct)
    } else {
        None
    }
}

/// Kinds that take part in consensus voting.
fn is_swarm_kind(descriptor: &WorkerDescriptor) -> bool {
    [
        Capability::Debugging,
        Capability::Correction,
        Capability::Testing,
        Capability::Recovery,
    ]
    .iter()
    .any(|c| descriptor.has_capability(c))
}

pub struct SwarmEngine {
    config: SwarmConfig,
    factory: Arc<WorkerFactory>,
    monitor: Arc<WorkerMonitor>,
    recovery: RecoveryManager,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Option<Arc<dyn HistorySink>>,
}

impl SwarmEngine {
    pub fn new(
        config: SwarmConfig,
        factory: Arc<WorkerFactory>,
        monitor: Arc<WorkerMonitor>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            recovery: RecoveryManager::new(&config),
            config,
            factory,
            monitor,
            checkpoints,
            sink: None,
        }
    }

    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Breakers persist across runs, so a target that keeps failing stays open.
    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub async fn run(
        &self,
        failures: Vec<Failure>,
        context: HashMap<String, serde_json::Value>,
    ) -> TaskforgeResult<WorkflowReport> {
        let state = SwarmState::new(failures, context);
        info!(run_id = %state.run_id, failures = state.failures.len(), "Swarm workflow started");
        self.drive(state).await
    }

    /// Continue a run from its last checkpoint with a fresh time budget.
    pub async fn resume(&self, run_id: &Uuid) -> TaskforgeResult<WorkflowReport> {
        let mut state = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| TaskforgeError::NotFound(format!("No checkpoint for run {run_id}")))?;
        if state.phase == WorkflowPhase::Done {
            return Ok(build_report(&state, &self.config));
        }
        info!(run_id = %run_id, phase = %state.phase, "Resuming swarm workflow");
        state.timed_out = false;
        self.drive(state).await
    }

    async fn drive(&self, mut state: SwarmState) -> TaskforgeResult<WorkflowReport> {
        let deadline = tokio::time::Instant::now() + self.config.workflow_timeout();
        loop {
            let phase = state.phase;
            if phase == WorkflowPhase::Report || phase == WorkflowPhase::Done {
                state.visited.push(WorkflowPhase::Report);
                state.phase = WorkflowPhase::Done;
                let report = build_report(&state, &self.config);
                self.finish(&state, &report).await;
                return Ok(report);
            }

            let next = match tokio::time::timeout_at(deadline, self.step(&mut state, phase)).await
            {
                Ok(next) => next,
                Err(_) => {
                    warn!(run_id = %state.run_id, phase = %phase, "Swarm workflow timed out");
                    state.timed_out = true;
                    self.checkpoint(&state).await;
                    let report = build_report(&state, &self.config);
                    if let Some(sink) = &self.sink {
                        sink.record_report(&report);
                    }
                    return Ok(report);
                }
            };

            info!(run_id = %state.run_id, phase = %phase, next = %next, "Workflow phase complete");
            state.visited.push(phase);
            state.phase = next;
            self.checkpoint(&state).await;
        }
    }

    async fn finish(&self, state: &SwarmState, report: &WorkflowReport) {
        let result = if self.config.keep_completed_checkpoints {
            self.checkpoints.save(state).await
        } else {
            self.checkpoints.remove(&state.run_id).await
        };
        if let Err(e) = result {
            warn!(run_id = %state.run_id, error = %e, "Failed to finalize checkpoint");
        }
        if let Some(sink) = &self.sink {
            sink.record_report(report);
        }
        info!(
            run_id = %report.run_id,
            groups = report.groups,
            success_rate = report.success_rate,
            unresolved = report.unresolved.len(),
            "Swarm workflow finished"
        );
    }

    async fn checkpoint(&self, state: &SwarmState) {
        if let Err(e) = self.checkpoints.save(state).await {
            warn!(run_id = %state.run_id, phase = %state.phase, error = %e, "Checkpoint failed");
        }
    }

    async fn step(&self, state: &mut SwarmState, phase: WorkflowPhase) -> WorkflowPhase {
        match phase {
            WorkflowPhase::Collect => self.collect_phase(state),
            WorkflowPhase::Analyze => self.analyze_phase(state),
            WorkflowPhase::Assign => self.assign_phase(state).await,
            WorkflowPhase::Debug => self.debug_phase(state).await,
            WorkflowPhase::Correct => self.correct_phase(state).await,
            WorkflowPhase::Test => self.test_phase(state).await,
            WorkflowPhase::Recover => self.recover_phase(state).await,
            WorkflowPhase::Monitor => self.monitor_phase(state).await,
            WorkflowPhase::Report | WorkflowPhase::Done => WorkflowPhase::Report,
        }
    }

    async fn lease(&self, kind: &str) -> TaskforgeResult<Lease<'_>> {
        let handle = self
            .factory
            .acquire_wait(kind, self.config.workflow_timeout())
            .await?;
        Ok(Lease {
            factory: &self.factory,
            worker: handle.worker.clone(),
            handle: Some(handle),
        })
    }

    fn collect_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        state.groups = collect(&state.failures);
        debug!(run_id = %state.run_id, groups = state.groups.len(), "Failures grouped");
        if state.groups.is_empty() {
            WorkflowPhase::Report
        } else {
            WorkflowPhase::Analyze
        }
    }

    fn analyze_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let summary = analyze(&state.groups, &state.failures, self.config.min_cluster_size);
        for cluster in &summary.clusters {
            debug!(
                error_type = %cluster.error_type,
                size = cluster.size,
                trend = %cluster.trend,
                "Recurring failure cluster"
            );
        }
        state.analysis = Some(summary);
        WorkflowPhase::Assign
    }

    async fn assign_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let voters: Vec<WorkerDescriptor> = self
            .factory
            .registry()
            .descriptors()
            .into_iter()
            .filter(is_swarm_kind)
            .collect();
        if voters.is_empty() {
            warn!(run_id = %state.run_id, "No registered kind can handle failures");
        }

        let mut ballots = Vec::with_capacity(state.groups.len());
        for group in &state.groups {
            let votes = join_all(voters.iter().map(|descriptor| async move {
                match self.lease(&descriptor.kind).await {
                    Ok(lease) => {
                        let score = lease.worker().confidence(group).await;
                        let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
                        Some((descriptor, score))
                    }
                    Err(e) => {
                        warn!(kind = %descriptor.kind, error = %e, "Kind skipped in consensus");
                        None
                    }
                }
            }))
            .await;
            ballots.push(votes.into_iter().flatten().collect::<Vec<_>>());
        }

        for (group, votes) in state.groups.iter().zip(ballots) {
            state
                .engaged_kinds
                .extend(votes.iter().map(|(d, _)| d.kind.clone()));
            state.processed.extend(group.failure_ids.iter().copied());

            let best = votes.into_iter().max_by(|(da, a), (db, b)| {
                a.total_cmp(b)
                    .then_with(|| da.priority_weight.cmp(&db.priority_weight))
                    .then_with(|| db.kind.cmp(&da.kind))
            });
            let Some((descriptor, confidence)) =
                best.filter(|(_, score)| *score >= self.config.consensus_threshold)
            else {
                warn!(
                    group = %group.id,
                    error_type = %group.error_type,
                    threshold = self.config.consensus_threshold,
                    "No consensus, deferring to monitoring"
                );
                state.deferred.push(group.id.clone());
                continue;
            };

            let route = if group.priority.requires_recovery()
                && descriptor.has_capability(&Capability::Recovery)
            {
                Route::Recover
            } else {
                repair_route(group.priority, descriptor).unwrap_or(Route::Correct)
            };
            info!(
                group = %group.id,
                kind = %descriptor.kind,
                confidence,
                ?route,
                "Failure group assigned"
            );
            for id in &group.failure_ids {
                state.consensus.insert(*id, descriptor.kind.clone());
            }
            match route {
                Route::Debug => state.pending_debug.push(group.id.clone()),
                Route::Correct => state.pending_correct.push(group.id.clone()),
                Route::Recover => state.pending_recover.push(group.id.clone()),
            }
            state.assignments.insert(
                group.id.clone(),
                Assignment {
                    kind: descriptor.kind.clone(),
                    confidence,
                    route,
                },
            );
        }

        if !state.pending_debug.is_empty() {
            WorkflowPhase::Debug
        } else if !state.pending_correct.is_empty() {
            WorkflowPhase::Correct
        } else if !state.pending_recover.is_empty() {
            WorkflowPhase::Recover
        } else {
            WorkflowPhase::Report
        }
    }

    async fn debug_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let work: Vec<(FailureGroup, String)> = state
            .pending_debug
            .iter()
            .filter_map(|id| Some((state.group(id)?.clone(), state.assignments.get(id)?.kind.clone())))
            .collect();

        let results = join_all(work.iter().map(|(group, kind)| async move {
            let lease = self.lease(kind).await?;
            let diagnosis = lease.worker().diagnose(group).await?;
            Ok::<_, TaskforgeError>(diagnosis)
        }))
        .await;

        for ((group, kind), result) in work.iter().zip(results) {
            match result {
                Ok(Some(diagnosis)) => {
                    info!(group = %group.id, kind = %kind, root_cause = %diagnosis.root_cause, "Diagnosed");
                    state.diagnoses.push(diagnosis);
                    state.pending_correct.push(group.id.clone());
                }
                Ok(None) => debug!(group = %group.id, kind = %kind, "No diagnosis"),
                Err(e) => warn!(group = %group.id, kind = %kind, error = %e, "Diagnosis failed"),
            }
        }
        state.pending_debug.clear();

        if !state.pending_correct.is_empty() {
            WorkflowPhase::Correct
        } else if !state.pending_recover.is_empty() {
            WorkflowPhase::Recover
        } else {
            WorkflowPhase::Report
        }
    }

    async fn correct_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let work: Vec<(FailureGroup, String)> = state
            .pending_correct
            .iter()
            .filter_map(|id| Some((state.group(id)?.clone(), state.assignments.get(id)?.kind.clone())))
            .collect();
        let diagnoses = &state.diagnoses;

        let results = join_all(work.iter().map(|(group, kind)| async move {
            let lease = self.lease(kind).await?;
            let diagnosis = diagnoses.iter().find(|d| d.group_id == group.id);
            let Some(mut fix) = lease.worker().propose_fix(group, diagnosis).await? else {
                return Ok(None);
            };
            fix.group_id = group.id.clone();
            fix.author_kind = kind.clone();
            fix.validated = lease.worker().validate_fix(&fix).await;
            Ok::<_, TaskforgeError>(Some(fix))
        }))
        .await;

        for ((group, kind), result) in work.iter().zip(results) {
            match result {
                Ok(Some(fix)) => {
                    if fix.validated {
                        info!(group = %group.id, kind = %kind, fix_id = %fix.id, "Fix validated");
                    } else {
                        warn!(group = %group.id, kind = %kind, fix_id = %fix.id, "Fix rejected by validation");
                    }
                    state.fixes.push(fix);
                }
                Ok(None) => debug!(group = %group.id, kind = %kind, "No fix proposed"),
                Err(e) => warn!(group = %group.id, kind = %kind, error = %e, "Correction failed"),
            }
        }
        state.pending_correct.clear();

        if state
            .fixes
            .iter()
            .any(|f| f.validated && !state.tests.iter().any(|t| t.fix_id == f.id))
        {
            WorkflowPhase::Test
        } else if !state.pending_recover.is_empty() {
            WorkflowPhase::Recover
        } else {
            WorkflowPhase::Report
        }
    }

    async fn test_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let untested: Vec<Fix> = state
            .fixes
            .iter()
            .filter(|f| f.validated && !state.tests.iter().any(|t| t.fix_id == f.id))
            .cloned()
            .collect();

        let outcomes = join_all(untested.iter().map(|fix| async move {
            let (verdict, detail) = match self.lease(&fix.author_kind).await {
                Ok(lease) => match lease.worker().run_tests(fix).await {
                    Ok(verdict) => (verdict, None),
                    Err(e) => (TestVerdict::Failed, Some(e.to_string())),
                },
                Err(e) => (TestVerdict::Skipped, Some(e.to_string())),
            };
            TestOutcome {
                fix_id: fix.id,
                group_id: fix.group_id.clone(),
                kind: fix.author_kind.clone(),
                verdict,
                detail,
            }
        }))
        .await;

        for outcome in outcomes {
            info!(fix_id = %outcome.fix_id, kind = %outcome.kind, verdict = ?outcome.verdict, "Fix tested");
            state.tests.push(outcome);
        }

        if state.pending_recover.is_empty() {
            WorkflowPhase::Monitor
        } else {
            WorkflowPhase::Recover
        }
    }

    async fn recover_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        if !state.in_flight.is_empty() {
            warn!(
                run_id = %state.run_id,
                interrupted = state.in_flight.len(),
                "Retrying recoveries interrupted by an earlier run"
            );
            state.in_flight.clear();
        }

        // Sequential: recoveries of one run often share a target and its breaker.
        for group_id in state.pending_recover.clone() {
            let (Some(group), Some(kind)) = (
                state.group(&group_id).cloned(),
                state.assignments.get(&group_id).map(|a| a.kind.clone()),
            ) else {
                continue;
            };
            let target = group.primary_component();
            let strategy = self.recovery.strategy_for(&group);
            state.in_flight.insert(
                group_id.clone(),
                RecoveryAction::new(&group_id, &target, strategy, 1),
            );

            let outcome = match self.lease(&kind).await {
                Ok(lease) => self.recovery.execute(lease.worker(), &kind, &group).await,
                Err(e) => RecoveryOutcome {
                    group_id: group_id.clone(),
                    target,
                    kind: kind.clone(),
                    strategy,
                    status: RecoveryStatus::Failed,
                    attempts: 0,
                    rolled_back: false,
                    error: Some(e.to_string()),
                },
            };
            state.in_flight.remove(&group_id);
            if !outcome.succeeded() {
                let fallback = self
                    .factory
                    .registry()
                    .descriptor(&kind)
                    .and_then(|d| repair_route(group.priority, &d));
                match fallback {
                    Some(Route::Debug) => state.pending_debug.push(group_id.clone()),
                    Some(_) => state.pending_correct.push(group_id.clone()),
                    None => {}
                }
                if fallback.is_some() {
                    info!(group = %group_id, kind = %kind, status = ?outcome.status, "Recovery unsuccessful, falling back to repair");
                }
            }
            state.recoveries.push(outcome);
            state.pending_recover.retain(|id| id != &group_id);
        }

        if !state.pending_debug.is_empty() {
            WorkflowPhase::Debug
        } else if !state.pending_correct.is_empty() {
            WorkflowPhase::Correct
        } else {
            WorkflowPhase::Monitor
        }
    }

    async fn monitor_phase(&self, state: &mut SwarmState) -> WorkflowPhase {
        let kinds: Vec<String> = state.engaged_kinds.iter().cloned().collect();
        let reports = join_all(kinds.iter().map(|kind| async move {
            match self.lease(kind).await {
                Ok(lease) => lease.worker().health().await,
                Err(e) => WorkerHealth::degraded(0.0, format!("unavailable: {e}")),
            }
        }))
        .await;

        for (kind, health) in kinds.into_iter().zip(reports) {
            if !health.healthy {
                warn!(kind = %kind, score = health.score, "Worker kind unhealthy");
            }
            state.health.insert(kind, health);
        }
        let score = if state.health.is_empty() {
            self.monitor.health_score()
        } else {
            state.health.values().map(|h| h.score).sum::<f64>() / state.health.len() as f64
        };
        state.health_score = Some(score);
        WorkflowPhase::Report
    }
}

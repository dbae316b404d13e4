//! Swarm workflow runs through the orchestrator facade: clustering and
//! recommendations, verified recovery with rollback, and breakers that
//! persist across runs.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use taskforge_core::{FailurePriority, TaskforgeError, TaskforgeResult};
use taskforge_orchestrator::swarm::{CircuitState, RecoveryStatus};
use taskforge_orchestrator::*;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Calls {
    recover: AtomicUsize,
    restore: AtomicUsize,
}

/// Recovery worker whose `recover` either errors or "succeeds" without
/// passing verification.
#[derive(Clone)]
struct Medic {
    calls: Arc<Calls>,
    recover_errors: bool,
}

#[async_trait]
impl Worker for Medic {
    async fn execute(
        &self,
        _task: &Task,
        _cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn confidence(&self, _group: &FailureGroup) -> f64 {
        0.95
    }

    async fn snapshot(&self, target: &str) -> TaskforgeResult<Option<serde_json::Value>> {
        Ok(Some(serde_json::json!({ "target": target, "release": "v41" })))
    }

    async fn recover(&self, action: &RecoveryAction) -> TaskforgeResult<()> {
        self.calls.recover.fetch_add(1, Ordering::SeqCst);
        if self.recover_errors {
            Err(TaskforgeError::Recovery(format!("{} unreachable", action.target)))
        } else {
            Ok(())
        }
    }

    async fn verify_recovery(&self, _action: &RecoveryAction) -> bool {
        false
    }

    async fn restore(&self, _target: &str, _snapshot: &serde_json::Value) -> TaskforgeResult<()> {
        self.calls.restore.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Correction worker that also advertises recovery in some tests but keeps
/// the default `recover`, which always errors.
#[derive(Clone)]
struct Patcher;

#[async_trait]
impl Worker for Patcher {
    async fn execute(
        &self,
        _task: &Task,
        _cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn confidence(&self, _group: &FailureGroup) -> f64 {
        0.9
    }

    async fn propose_fix(
        &self,
        group: &FailureGroup,
        _diagnosis: Option<&Diagnosis>,
    ) -> TaskforgeResult<Option<Fix>> {
        Ok(Some(Fix::new(
            &group.id,
            "patcher",
            "raise client timeout",
            vec!["timeout = 60s".into()],
        )))
    }
}

async fn patcher_orchestrator(capabilities: Vec<Capability>) -> Orchestrator {
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register(
            WorkerDescriptor::new("patcher", WorkerCategory::Correction)
                .with_capabilities(capabilities)
                .with_instances(0, 1),
            worker_builder(|| Patcher),
        )
        .unwrap();
    Orchestrator::builder(fast_config(), registry).build().await.unwrap()
}

fn critical_timeout() -> Vec<Failure> {
    vec![Failure::new(
        "upstream",
        "request timed out after 30s",
        "inventory",
        FailurePriority::Critical,
    )]
}

async fn orchestrator(medic: Option<Medic>, config: TaskforgeConfig) -> Orchestrator {
    let registry = Arc::new(WorkerRegistry::new());
    if let Some(medic) = medic {
        registry
            .register(
                WorkerDescriptor::new("medic", WorkerCategory::Recovery)
                    .with_capability(Capability::Recovery)
                    .with_instances(0, 1),
                worker_builder(move || medic.clone()),
            )
            .unwrap();
    }
    Orchestrator::builder(config, registry).build().await.unwrap()
}

fn fast_config() -> TaskforgeConfig {
    let mut config = TaskforgeConfig::default();
    config.swarm.retry_base_delay_ms = 1;
    config.swarm.retry_max_delay_ms = 5;
    config
}

#[tokio::test]
async fn test_recurring_pattern_is_clustered() {
    let orchestrator = orchestrator(None, fast_config()).await;
    let mut failures: Vec<Failure> = (0..6)
        .map(|i| {
            Failure::new(
                "timeout",
                format!("request to billing timed out after {}ms", 3000 + i * 250),
                "billing",
                FailurePriority::Medium,
            )
        })
        .collect();
    failures.push(Failure::new("io", "disk full on /var/data/db", "storage", FailurePriority::Low));
    failures.push(Failure::new("auth", "token rejected", "gateway", FailurePriority::Low));
    failures.push(Failure::new("parse", "unexpected end of input", "parser", FailurePriority::Low));
    failures.push(Failure::new("cache", "cache miss storm", "cache", FailurePriority::Low));

    let report = orchestrator
        .run_swarm_workflow(failures, HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.total_failures, 10);
    assert_eq!(report.groups, 5);
    assert_eq!(report.analysis.clusters.len(), 1);
    let cluster = &report.analysis.clusters[0];
    assert_eq!(cluster.size, 6);
    assert_eq!(cluster.error_type, "timeout");
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.starts_with("High-frequency pattern detected: timeout")));
    // Nobody can handle these, so every group is deferred and unresolved.
    assert_eq!(report.deferred, 5);
    assert!(!report.resolved());
}

#[tokio::test]
async fn test_unverified_recovery_rolls_back() {
    let calls = Arc::new(Calls::default());
    let medic = Medic {
        calls: calls.clone(),
        recover_errors: false,
    };
    let orchestrator = orchestrator(Some(medic), fast_config()).await;
    let failures = vec![Failure::new(
        "deploy_error",
        "release v42 crashed on start",
        "checkout",
        FailurePriority::Critical,
    )];

    let report = orchestrator
        .run_swarm_workflow(failures, HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.recoveries.len(), 1);
    let outcome = &report.recoveries[0];
    assert_eq!(outcome.strategy, RecoveryStrategy::Rollback);
    assert_eq!(outcome.status, RecoveryStatus::Failed);
    assert!(outcome.rolled_back);
    assert_eq!(calls.restore.load(Ordering::SeqCst), 1);
    assert_eq!(report.recoveries_succeeded, 0);
    assert!(report.success_rate < 1.0);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.contains("rolled back to snapshot")));
    assert!(report.phases.contains(&WorkflowPhase::Recover));
}

#[tokio::test]
async fn test_open_circuit_spans_runs() {
    let calls = Arc::new(Calls::default());
    let medic = Medic {
        calls: calls.clone(),
        recover_errors: true,
    };
    let mut config = fast_config();
    config.swarm.circuit_breaker_threshold = 2;
    config.swarm.auto_rollback = false;
    let orchestrator = orchestrator(Some(medic), config).await;
    let failure = || {
        vec![Failure::new(
            "connection_error",
            "connection reset by primary",
            "orders-db",
            FailurePriority::Critical,
        )]
    };

    for _ in 0..2 {
        let report = orchestrator
            .run_swarm_workflow(failure(), HashMap::new())
            .await
            .unwrap();
        assert_eq!(report.recoveries[0].status, RecoveryStatus::Failed);
        assert_eq!(report.recoveries[0].strategy, RecoveryStrategy::CircuitBreaker);
    }
    assert_eq!(
        orchestrator.swarm().recovery().breakers().state("orders-db"),
        CircuitState::Open
    );

    let report = orchestrator
        .run_swarm_workflow(failure(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(
        report.recoveries[0].status,
        RecoveryStatus::RejectedCircuitOpen
    );
    assert_eq!(report.recoveries[0].attempts, 0);
    assert_eq!(calls.recover.load(Ordering::SeqCst), 2);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.starts_with("Circuit open for orders-db")));
}

#[tokio::test]
async fn test_critical_failure_goes_to_correction_when_kind_cannot_recover() {
    let orchestrator = patcher_orchestrator(vec![Capability::Correction]).await;
    let report = orchestrator
        .run_swarm_workflow(critical_timeout(), HashMap::new())
        .await
        .unwrap();

    assert!(!report.phases.contains(&WorkflowPhase::Recover));
    assert!(report.phases.contains(&WorkflowPhase::Correct));
    assert!(report.recoveries.is_empty());
    assert_eq!(report.fixes_applied, 1);
    assert!(report.resolved());
    assert_eq!(
        orchestrator.swarm().recovery().breakers().state("inventory"),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_failed_recovery_falls_back_to_correction() {
    let orchestrator =
        patcher_orchestrator(vec![Capability::Recovery, Capability::Correction]).await;
    let report = orchestrator
        .run_swarm_workflow(critical_timeout(), HashMap::new())
        .await
        .unwrap();

    assert_eq!(report.recoveries.len(), 1);
    assert_eq!(report.recoveries[0].status, RecoveryStatus::Failed);
    let recover = report
        .phases
        .iter()
        .position(|p| *p == WorkflowPhase::Recover)
        .unwrap();
    let correct = report
        .phases
        .iter()
        .position(|p| *p == WorkflowPhase::Correct)
        .unwrap();
    assert!(recover < correct);
    assert_eq!(report.fixes_applied, 1);
    assert!(report.resolved());
}

#[tokio::test]
async fn test_history_sink_receives_reports() {
    let sink = Arc::new(MemoryHistorySink::new());
    let orchestrator = Orchestrator::builder(fast_config(), Arc::new(WorkerRegistry::new()))
        .history_sink(sink.clone())
        .build()
        .await
        .unwrap();

    let report = orchestrator
        .run_swarm_workflow(Vec::new(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(report.phases, vec![WorkflowPhase::Collect, WorkflowPhase::Report]);
    assert_eq!(sink.reports(), vec![report]);
}

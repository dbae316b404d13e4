use crate::swarm::{Diagnosis, FailureGroup, Fix, RecoveryAction, TestVerdict};
use crate::types::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Health report a worker returns during the Monitor phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub healthy: bool,
    /// 0.0 (down) to 1.0 (fully healthy).
    pub score: f64,
    pub detail: Option<String>,
}

impl WorkerHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            score: 1.0,
            detail: None,
        }
    }

    pub fn degraded(score: f64, detail: impl Into<String>) -> Self {
        Self {
            healthy: score >= 0.5,
            score: score.clamp(0.0, 1.0),
            detail: Some(detail.into()),
        }
    }
}

/// Execution contract every worker kind implements.
///
/// Only `execute` is required. The remaining hooks are consulted by the swarm
/// workflow; their defaults make a worker abstain from every phase.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run one task. Implementations should check `cancel` at their yield points
    /// and return [`TaskforgeError::Cancelled`] when it fires.
    async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value>;

    /// Confidence (0..=1) that this kind can handle the failure group.
    async fn confidence(&self, _group: &FailureGroup) -> f64 {
        0.0
    }

    async fn diagnose(&self, _group: &FailureGroup) -> TaskforgeResult<Option<Diagnosis>> {
        Ok(None)
    }

    async fn propose_fix(
        &self,
        _group: &FailureGroup,
        _diagnosis: Option<&Diagnosis>,
    ) -> TaskforgeResult<Option<Fix>> {
        Ok(None)
    }

    /// Decide whether a proposed fix may be counted as applied.
    async fn validate_fix(&self, fix: &Fix) -> bool {
        !fix.changes.is_empty()
    }

    async fn run_tests(&self, _fix: &Fix) -> TaskforgeResult<TestVerdict> {
        Ok(TestVerdict::Skipped)
    }

    /// Capture state of `target` before a recovery action changes it.
    async fn snapshot(&self, _target: &str) -> TaskforgeResult<Option<serde_json::Value>> {
        Ok(None)
    }

    async fn recover(&self, action: &RecoveryAction) -> TaskforgeResult<()> {
        Err(TaskforgeError::Recovery(format!(
            "worker does not implement {} recovery",
            action.strategy
        )))
    }

    /// Check that a recovery action actually fixed its target.
    async fn verify_recovery(&self, _action: &RecoveryAction) -> bool {
        true
    }

    async fn restore(&self, _target: &str, _snapshot: &serde_json::Value) -> TaskforgeResult<()> {
        Ok(())
    }

    async fn health(&self) -> WorkerHealth {
        WorkerHealth::healthy()
    }

    /// Called once when the factory retires the instance.
    async fn cleanup(&self) -> TaskforgeResult<()> {
        Ok(())
    }
}

/// Constructs worker instances for one registered kind.
pub trait WorkerBuilder: Send + Sync {
    fn build(
        &self,
        instance_id: Uuid,
        config: Option<&serde_json::Value>,
    ) -> TaskforgeResult<Arc<dyn Worker>>;
}

struct FnBuilder<F>(F);

impl<F, W> WorkerBuilder for FnBuilder<F>
where
    F: Fn() -> W + Send + Sync,
    W: Worker + 'static,
{
    fn build(
        &self,
        _instance_id: Uuid,
        _config: Option<&serde_json::Value>,
    ) -> TaskforgeResult<Arc<dyn Worker>> {
        Ok(Arc::new((self.0)()))
    }
}

/// Builder from a plain constructor closure.
pub fn worker_builder<F, W>(make: F) -> Arc<dyn WorkerBuilder>
where
    F: Fn() -> W + Send + Sync + 'static,
    W: Worker + 'static,
{
    Arc::new(FnBuilder(make))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::swarm::RecoveryStrategy;
    use crate::types::SubmitRequest;

    struct Noop;

    #[async_trait]
    impl Worker for Noop {
        async fn execute(
            &self,
            task: &Task,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<serde_json::Value> {
            Ok(serde_json::json!({ "id": task.id }))
        }
    }

    #[tokio::test]
    async fn test_default_hooks_abstain() {
        let worker = Noop;
        let fix = Fix::new("g", "noop", "nothing", vec![]);
        assert!(!worker.validate_fix(&fix).await);
        assert_eq!(worker.run_tests(&fix).await.unwrap(), TestVerdict::Skipped);
        assert!(worker.snapshot("db").await.unwrap().is_none());
        assert!(worker.health().await.healthy);

        let action = RecoveryAction::new("g", "db", RecoveryStrategy::Restart, 1);
        let err = worker.recover(&action).await.unwrap_err();
        assert!(matches!(err, TaskforgeError::Recovery(_)));
    }

    #[tokio::test]
    async fn test_builder_constructs_instances() {
        let builder = worker_builder(|| Noop);
        let worker = builder.build(Uuid::new_v4(), None).unwrap();
        let task = Task::from_request(SubmitRequest::new("noop"), 0);
        let out = worker
            .execute(&task, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out["id"], serde_json::json!(task.id));
    }

    #[test]
    fn test_degraded_health_clamps() {
        let health = WorkerHealth::degraded(1.7, "overloaded");
        assert_eq!(health.score, 1.0);
        assert!(!WorkerHealth::degraded(0.2, "down").healthy);
    }
}

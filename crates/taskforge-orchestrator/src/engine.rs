//! The orchestrator facade: wires registry, pools, scheduler, workspace
//! distributor and swarm engine together and owns their background loops.

use crate::config::TaskforgeConfig;
use crate::factory::{FactoryMetrics, PoolUtilization, WorkerFactory};
use crate::history::{HistorySink, JsonlHistorySink};
use crate::monitor::WorkerMonitor;
use crate::registry::WorkerRegistry;
use crate::scheduler::Scheduler;
use crate::swarm::{
    CheckpointStore, Failure, FileCheckpointStore, MemoryCheckpointStore, SwarmEngine,
    WorkflowReport,
};
use crate::types::{CancelAck, StatusReport, SubmitRequest, Task};
use crate::workspace::{
    DistributeRequest, DistributorStats, GitWorktreeProvisioner, InMemoryProvisioner,
    WorkspaceCapability, WorkspaceDistributor, WorkspaceProvisioner, WorkspaceTask,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{TaskId, TaskforgeError, TaskforgeResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine-wide counters returned by [`Orchestrator::statistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStats {
    pub queue_depth: usize,
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub cancelled_count: u64,
    pub per_kind_utilization: Vec<PoolUtilization>,
    pub health_score: f64,
    pub factory: FactoryMetrics,
    pub workspaces: DistributorStats,
}

/// Collects optional collaborators before [`OrchestratorBuilder::build`].
pub struct OrchestratorBuilder {
    config: TaskforgeConfig,
    registry: Arc<WorkerRegistry>,
    provisioner: Option<Arc<dyn WorkspaceProvisioner>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    sink: Option<Arc<dyn HistorySink>>,
}

impl OrchestratorBuilder {
    pub fn provisioner(mut self, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Validate the configuration and construct every component. Collaborators
    /// not set explicitly come from the config: a git repository selects
    /// worktree provisioning, `checkpoint_dir` selects file checkpoints and
    /// `history.path` a JSONL history log.
    pub async fn build(self) -> TaskforgeResult<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let provisioner: Arc<dyn WorkspaceProvisioner> = match self.provisioner {
            Some(p) => p,
            None => match (&config.distributor.repository, &config.distributor.worktree_dir) {
                (Some(repo), Some(dir)) => Arc::new(GitWorktreeProvisioner::new(repo, dir)),
                (Some(repo), None) => Arc::new(GitWorktreeProvisioner::in_repository(repo)),
                (None, _) => Arc::new(InMemoryProvisioner::new()),
            },
        };
        let checkpoints: Arc<dyn CheckpointStore> = match self.checkpoints {
            Some(store) => store,
            None => match &config.swarm.checkpoint_dir {
                Some(dir) => Arc::new(FileCheckpointStore::open(dir).await?),
                None => Arc::new(MemoryCheckpointStore::new()),
            },
        };
        let sink: Option<Arc<dyn HistorySink>> = match self.sink {
            Some(sink) => Some(sink),
            None => match &config.history.path {
                Some(path) => Some(Arc::new(JsonlHistorySink::open(path).await?)),
                None => None,
            },
        };

        let monitor = Arc::new(WorkerMonitor::new());
        let factory = Arc::new(WorkerFactory::new(
            self.registry.clone(),
            config.pool.clone(),
        ));
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let mut scheduler = Scheduler::builder(
            config.scheduler.clone(),
            factory.clone(),
            monitor.clone(),
        )
        .failure_channel(failure_tx);
        let mut swarm = SwarmEngine::new(
            config.swarm.clone(),
            factory.clone(),
            monitor.clone(),
            checkpoints,
        );
        if let Some(sink) = sink {
            scheduler = scheduler.history_sink(sink.clone());
            swarm = swarm.with_history_sink(sink);
        }

        Ok(Orchestrator {
            distributor: WorkspaceDistributor::new(config.distributor.clone(), provisioner),
            scheduler: scheduler.build(),
            swarm: Arc::new(swarm),
            registry: self.registry,
            factory,
            monitor,
            config,
            failures: Mutex::new(Some(failure_rx)),
            shutdown: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        })
    }
}

/// Explicitly constructed engine instance. Share it by `Arc`.
pub struct Orchestrator {
    config: TaskforgeConfig,
    registry: Arc<WorkerRegistry>,
    factory: Arc<WorkerFactory>,
    monitor: Arc<WorkerMonitor>,
    scheduler: Scheduler,
    distributor: WorkspaceDistributor,
    swarm: Arc<SwarmEngine>,
    /// Taken by `start` for the healer loop.
    failures: Mutex<Option<mpsc::UnboundedReceiver<Failure>>>,
    shutdown: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start building an orchestrator over `registry`.
    pub fn builder(config: TaskforgeConfig, registry: Arc<WorkerRegistry>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            registry,
            provisioner: None,
            checkpoints: None,
            sink: None,
        }
    }

    /// Shorthand for a builder with only an explicit provisioner.
    pub async fn new(
        config: TaskforgeConfig,
        registry: Arc<WorkerRegistry>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
    ) -> TaskforgeResult<Self> {
        Self::builder(config, registry)
            .provisioner(provisioner)
            .build()
            .await
    }

    /// Warm the pools and spawn the scheduler, distributor, sweeper and healer loops.
    pub fn start(&self) -> TaskforgeResult<()> {
        let Some(failures) = self.failures.lock().take() else {
            return Err(TaskforgeError::Config("orchestrator already started".into()));
        };
        if self.config.pool.warm_up {
            let created = self.factory.warm_up()?;
            info!(created, "Worker pools warmed up");
        }

        let mut loops = self.loops.lock();
        loops.push(self.scheduler.start(self.shutdown.child_token()));
        loops.push(self.distributor.start(self.shutdown.child_token()));
        loops.push(self.factory.spawn_sweeper(self.shutdown.child_token()));
        loops.push(spawn_healer(
            self.swarm.clone(),
            failures,
            self.config.swarm.heal_batch_size,
            self.config.swarm.heal_window(),
            self.shutdown.child_token(),
        ));
        info!(kinds = self.registry.len(), "Orchestrator started");
        Ok(())
    }

    /// Signal running tasks to stop, stop every loop and retire idle instances.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.scheduler.cancel_running();
        let loops: Vec<JoinHandle<()>> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Background loop panicked");
            }
        }
        let retired = self.factory.shutdown().await;
        info!(cancelled, retired, "Orchestrator stopped");
    }

    pub fn submit(&self, request: SubmitRequest) -> TaskforgeResult<TaskId> {
        self.scheduler.submit(request)
    }

    pub fn status(&self, id: &TaskId) -> TaskforgeResult<StatusReport> {
        self.scheduler.status(id)
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.scheduler.task(id)
    }

    /// Cancel a scheduler task or, failing that, a workspace task with this id.
    pub async fn cancel(&self, id: &TaskId) -> TaskforgeResult<CancelAck> {
        match self.scheduler.cancel(id) {
            Err(TaskforgeError::NotFound(_)) => self.distributor.cancel(id).await,
            other => other,
        }
    }

    pub fn retry(&self, id: &TaskId) -> TaskforgeResult<TaskId> {
        self.scheduler.retry(id)
    }

    pub async fn wait_for(&self, id: &TaskId, timeout: Duration) -> TaskforgeResult<StatusReport> {
        self.scheduler.wait_for(id, timeout).await
    }

    pub async fn distribute(&self, request: DistributeRequest) -> TaskforgeResult<TaskId> {
        self.distributor.distribute(request).await
    }

    pub async fn workspace_task(&self, id: &TaskId) -> TaskforgeResult<WorkspaceTask> {
        self.distributor.status(id).await
    }

    pub async fn complete_workspace_task(
        &self,
        id: &TaskId,
        result: Result<serde_json::Value, String>,
    ) -> TaskforgeResult<()> {
        self.distributor.complete(id, result).await
    }

    pub async fn assign_workspace_task(
        &self,
        id: &TaskId,
        workspace_id: &str,
        force: bool,
    ) -> TaskforgeResult<()> {
        self.distributor.assign_to(id, workspace_id, force).await
    }

    pub async fn workspaces(&self) -> Vec<WorkspaceCapability> {
        self.distributor.workspaces().await
    }

    pub async fn run_swarm_workflow(
        &self,
        failures: Vec<Failure>,
        context: HashMap<String, serde_json::Value>,
    ) -> TaskforgeResult<WorkflowReport> {
        self.swarm.run(failures, context).await
    }

    pub async fn resume_workflow(&self, run_id: &Uuid) -> TaskforgeResult<WorkflowReport> {
        self.swarm.resume(run_id).await
    }

    pub async fn statistics(&self) -> OrchestratorStats {
        let scheduler = self.scheduler.statistics();
        OrchestratorStats {
            queue_depth: scheduler.queue_depth,
            pending_count: scheduler.pending,
            active_count: scheduler.active,
            completed_count: scheduler.completed,
            failed_count: scheduler.failed,
            cancelled_count: scheduler.cancelled,
            per_kind_utilization: scheduler.per_kind,
            health_score: scheduler.health_score,
            factory: self.factory.metrics(),
            workspaces: self.distributor.statistics().await,
        }
    }

    pub fn config(&self) -> &TaskforgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<WorkerFactory> {
        &self.factory
    }

    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn distributor(&self) -> &WorkspaceDistributor {
        &self.distributor
    }

    pub fn swarm(&self) -> &Arc<SwarmEngine> {
        &self.swarm
    }
}

/// Batch failures of auto-heal tasks and run the swarm workflow on each batch.
/// A batch closes when it reaches `batch_size` or `window` after its first failure.
fn spawn_healer(
    swarm: Arc<SwarmEngine>,
    mut failures: mpsc::UnboundedReceiver<Failure>,
    batch_size: usize,
    window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = failures.recv() => match next {
                    Some(failure) => failure,
                    None => break,
                },
            };
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + window;
            while batch.len() < batch_size.max(1) {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    next = failures.recv() => match next {
                        Some(failure) => batch.push(failure),
                        None => break,
                    },
                }
            }

            let size = batch.len();
            let context = HashMap::from([(
                "source".to_string(),
                serde_json::Value::String("auto_heal".into()),
            )]);
            match swarm.run(batch, context).await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    failures = size,
                    success_rate = report.success_rate,
                    "Auto-heal workflow finished"
                ),
                Err(e) => warn!(failures = size, error = %e, "Auto-heal workflow failed"),
            }
        }
        info!("Healer loop stopped");
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::history::MemoryHistorySink;
    use crate::registry::{WorkerCategory, WorkerDescriptor};
    use crate::types::TaskStatus;
    use crate::worker::{worker_builder, Worker};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn execute(
            &self,
            task: &Task,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<serde_json::Value> {
            Ok(serde_json::to_value(&task.payload)?)
        }
    }

    struct Broken;

    #[async_trait]
    impl Worker for Broken {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<serde_json::Value> {
            Err(TaskforgeError::Execution("connection refused by db-1".into()))
        }
    }

    fn registry() -> Arc<WorkerRegistry> {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register(
                WorkerDescriptor::new("echo", WorkerCategory::General).with_instances(0, 2),
                worker_builder(|| Echo),
            )
            .unwrap();
        registry
            .register(
                WorkerDescriptor::new("broken", WorkerCategory::General).with_instances(0, 1),
                worker_builder(|| Broken),
            )
            .unwrap();
        registry
    }

    fn config() -> TaskforgeConfig {
        let mut config = TaskforgeConfig::default();
        config.scheduler.tick_interval_ms = 10;
        config.swarm.heal_window_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let orchestrator = Orchestrator::builder(config(), registry())
            .build()
            .await
            .unwrap();
        orchestrator.start().unwrap();

        let id = orchestrator
            .submit(SubmitRequest::new("echo").with_field("n", serde_json::json!(1)))
            .unwrap();
        let report = orchestrator
            .wait_for(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.state, TaskStatus::Completed);
        assert_eq!(report.result, Some(serde_json::json!({"n": 1})));

        let stats = orchestrator.statistics().await;
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.active_count, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let orchestrator = Orchestrator::builder(config(), registry())
            .build()
            .await
            .unwrap();
        orchestrator.start().unwrap();
        assert!(matches!(orchestrator.start(), Err(TaskforgeError::Config(_))));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = config();
        config.swarm.consensus_threshold = 2.0;
        assert!(Orchestrator::builder(config, registry()).build().await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_falls_back_to_workspace_tasks() {
        let orchestrator = Orchestrator::builder(config(), registry())
            .build()
            .await
            .unwrap();
        let id = orchestrator
            .distribute(DistributeRequest::new("frontend", "build the page"))
            .await
            .unwrap();
        assert_eq!(orchestrator.cancel(&id).await.unwrap(), CancelAck::Cancelled);
        assert!(matches!(
            orchestrator.cancel(&Uuid::new_v4()).await,
            Err(TaskforgeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_heal_runs_swarm_workflow() {
        let sink = Arc::new(MemoryHistorySink::new());
        let orchestrator = Orchestrator::builder(config(), registry())
            .history_sink(sink.clone())
            .build()
            .await
            .unwrap();
        orchestrator.start().unwrap();

        let id = orchestrator
            .submit(SubmitRequest::new("broken").auto_heal(true))
            .unwrap();
        let report = orchestrator
            .wait_for(&id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(report.state, TaskStatus::Failed);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sink.reports().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_failures, 1);
        orchestrator.shutdown().await;
    }
}

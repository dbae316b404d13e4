//! Multi-agent task orchestration: worker pools, priority scheduling,
//! workspace distribution and the self-healing swarm workflow.
//!
//! # Main types
//!
//! - [`Orchestrator`] — Facade that owns every component and its background loops.
//! - [`WorkerRegistry`] / [`WorkerFactory`] — Worker kinds and their bounded instance pools.
//! - [`Scheduler`] — Priority queue, dependency tracking and dispatch to pooled workers.
//! - [`StrategyEngine`] — Pluggable candidate selection (load, performance, affinity...).
//! - [`WorkspaceDistributor`] — Routes typed tasks to isolated workspaces (git worktrees).
//! - [`SwarmEngine`] — Collect, analyze, assign, debug, correct, test, recover, monitor, report.

/// Engine configuration loaded from TOML.
pub mod config;
/// Dependency tracking between tasks.
pub mod dependency;
/// Orchestrator facade and lifecycle.
pub mod engine;
/// Bounded per-kind worker pools.
pub mod factory;
/// Task and workflow history sinks.
pub mod history;
/// Per-kind execution metrics and health.
pub mod monitor;
/// Worker kind registry.
pub mod registry;
/// Priority scheduler.
pub mod scheduler;
/// Task storage with bounded terminal history.
pub mod store;
/// Distribution strategies.
pub mod strategy;
/// Swarm failure-handling workflow.
pub mod swarm;
/// Priority task queue.
pub mod task_queue;
/// Shared task types.
pub mod types;
/// The worker contract.
pub mod worker;
/// Isolated-workspace task distribution.
pub mod workspace;

pub use config::{
    DistributorConfig, HistoryConfig, PoolConfig, SchedulerConfig, SwarmConfig, TaskforgeConfig,
};
pub use dependency::DependencyGraph;
pub use engine::{Orchestrator, OrchestratorBuilder, OrchestratorStats};
pub use factory::{FactoryMetrics, InstanceInfo, PoolUtilization, WorkerFactory, WorkerHandle};
pub use history::{HistoryEntry, HistoryRecord, HistorySink, JsonlHistorySink, MemoryHistorySink};
pub use monitor::{KindMetrics, WorkerMonitor};
pub use registry::{Capability, WorkerCategory, WorkerDescriptor, WorkerRegistry};
pub use scheduler::{Scheduler, SchedulerStats};
pub use strategy::{Candidate, DistributionStrategy, StrategyEngine, TaskProfile};
pub use swarm::{
    CheckpointStore, Diagnosis, Failure, FailureGroup, FileCheckpointStore, Fix,
    MemoryCheckpointStore, RecoveryAction, RecoveryStrategy, SwarmEngine, TestVerdict,
    WorkflowPhase, WorkflowReport,
};
pub use task_queue::TaskQueue;
pub use types::{CancelAck, Payload, StatusReport, SubmitRequest, Task, TaskStatus, TaskTarget};
pub use worker::{worker_builder, Worker, WorkerBuilder, WorkerHealth};
pub use workspace::{
    DistributeRequest, DistributorStats, GitWorktreeProvisioner, InMemoryProvisioner,
    WorkspaceCapability, WorkspaceDistributor, WorkspaceProvisioner, WorkspaceTask,
    WorkspaceTaskStatus,
};

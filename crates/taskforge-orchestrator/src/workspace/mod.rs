//! Distribution of tasks that must run inside a dedicated, independently
//! branched workspace.

mod provisioner;

pub use provisioner::{GitWorktreeProvisioner, InMemoryProvisioner, WorkspaceProvisioner};

use crate::config::DistributorConfig;
use crate::dependency::DependencyGraph;
use crate::store::TerminalTotals;
use crate::strategy::{Candidate, DistributionStrategy, StrategyEngine, TaskProfile};
use crate::task_queue::TaskQueue;
use crate::types::{CancelAck, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::{Priority, TaskId, TaskforgeError, TaskforgeResult};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Weight of the previous affinity value in the moving average.
const AFFINITY_DECAY: f64 = 0.7;

/// Final statuses of evicted tasks are remembered for this many times the
/// history limit, so late dependents still see how their dependency ended.
const OUTCOME_MEMORY_FACTOR: usize = 8;

/// Load, history and learned preferences of one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceCapability {
    pub id: String,
    /// Task type this workspace was provisioned for.
    pub specialization: Option<String>,
    pub branch: String,
    pub path: Option<PathBuf>,
    pub current_load: usize,
    pub max_load: usize,
    pub performance_score: f64,
    pub error_rate: f64,
    pub avg_completion_ms: f64,
    pub completed: u64,
    pub failed: u64,
    pub affinity: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WorkspaceCapability {
    fn new(id: String, specialization: Option<String>, branch: String, max_load: usize) -> Self {
        let now = Utc::now();
        Self {
            id,
            specialization,
            branch,
            path: None,
            current_load: 0,
            max_load,
            performance_score: 0.5,
            error_rate: 0.0,
            avg_completion_ms: 0.0,
            completed: 0,
            failed: 0,
            affinity: HashMap::new(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Fold one finished task into the running statistics.
    pub fn record_completion(&mut self, task_type: &str, duration_ms: u64, success: bool) {
        let finished_before = (self.completed + self.failed) as f64;
        self.avg_completion_ms =
            (self.avg_completion_ms * finished_before + duration_ms as f64) / (finished_before + 1.0);
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.error_rate = self.failed as f64 / (self.completed + self.failed) as f64;
        self.performance_score =
            (1.0 - self.error_rate) / (1.0 + self.avg_completion_ms / 60_000.0);

        let outcome = if success { 1.0 } else { 0.0 };
        let previous = self.affinity.get(task_type).copied().unwrap_or(0.5);
        self.affinity.insert(
            task_type.to_string(),
            AFFINITY_DECAY * previous + (1.0 - AFFINITY_DECAY) * outcome,
        );
        self.last_activity = Utc::now();
    }

    fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id.clone(),
            specialization: self.specialization.clone(),
            current_load: self.current_load,
            max_load: self.max_load,
            performance_score: self.performance_score,
            error_rate: self.error_rate,
            affinity: self.affinity.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceTaskStatus {
    Pending,
    Queued,
    Assigned,
    Completed,
    Failed,
    Cancelled,
}

impl WorkspaceTaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkspaceTaskStatus::Completed
                | WorkspaceTaskStatus::Failed
                | WorkspaceTaskStatus::Cancelled
        )
    }
}

impl From<WorkspaceTaskStatus> for TaskStatus {
    fn from(status: WorkspaceTaskStatus) -> Self {
        match status {
            WorkspaceTaskStatus::Pending => TaskStatus::Pending,
            WorkspaceTaskStatus::Queued => TaskStatus::Queued,
            WorkspaceTaskStatus::Assigned => TaskStatus::Assigned,
            WorkspaceTaskStatus::Completed => TaskStatus::Completed,
            WorkspaceTaskStatus::Failed => TaskStatus::Failed,
            WorkspaceTaskStatus::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// A task placed into a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceTask {
    pub id: TaskId,
    pub task_type: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub strategy: Option<DistributionStrategy>,
    pub status: WorkspaceTaskStatus,
    pub workspace_id: Option<String>,
    /// Branch-style identifier generated at assignment.
    pub branch: Option<String>,
    /// Assigned past the workspace's max load through the override path.
    pub forced: bool,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    #[serde(skip)]
    sequence: u64,
}

/// Input to [`WorkspaceDistributor::distribute`].
#[derive(Debug, Clone)]
pub struct DistributeRequest {
    pub id: Option<TaskId>,
    pub task_type: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub priority: Priority,
    pub dependencies: Vec<TaskId>,
    pub strategy: Option<DistributionStrategy>,
}

impl DistributeRequest {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            description: description.into(),
            requirements: Vec::new(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            strategy: None,
        }
    }

    /// Use a caller-chosen id, so other tasks can depend on it before it is distributed.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistributorStats {
    pub workspaces: usize,
    pub total_load: usize,
    pub total_capacity: usize,
    pub pending: usize,
    pub queued: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub avg_performance: f64,
}

struct DistributorState {
    workspaces: BTreeMap<String, WorkspaceCapability>,
    tasks: HashMap<TaskId, WorkspaceTask>,
    /// Finished task ids, oldest first.
    history: VecDeque<TaskId>,
    history_limit: usize,
    /// Final status of tasks evicted from `tasks`, oldest first.
    outcomes: HashMap<TaskId, WorkspaceTaskStatus>,
    outcome_order: VecDeque<TaskId>,
    totals: TerminalTotals,
    waiting: TaskQueue,
    graph: DependencyGraph,
    next_seq: u64,
    next_workspace: u64,
}

impl DistributorState {
    fn status_of(&self, id: &TaskId) -> Option<WorkspaceTaskStatus> {
        self.tasks
            .get(id)
            .map(|t| t.status)
            .or_else(|| self.outcomes.get(id).copied())
    }

    /// Record a task that just reached a terminal state, evicting the oldest
    /// finished tasks past the history limit.
    fn archive(&mut self, id: TaskId) {
        let Some(status) = self.tasks.get(&id).map(|t| t.status) else {
            return;
        };
        match status {
            WorkspaceTaskStatus::Completed => self.totals.completed += 1,
            WorkspaceTaskStatus::Failed => self.totals.failed += 1,
            WorkspaceTaskStatus::Cancelled => self.totals.cancelled += 1,
            _ => return,
        }
        self.history.push_back(id);

        while self.history.len() > self.history_limit {
            let Some(old) = self.history.pop_front() else {
                break;
            };
            if let Some(task) = self.tasks.remove(&old) {
                self.outcomes.insert(old, task.status);
                self.outcome_order.push_back(old);
            }
        }
        let outcome_limit = self.history_limit.saturating_mul(OUTCOME_MEMORY_FACTOR);
        while self.outcome_order.len() > outcome_limit {
            if let Some(old) = self.outcome_order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }

    fn fail(&mut self, id: TaskId, reason: String) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.status = WorkspaceTaskStatus::Failed;
        task.error = Some(reason);
        task.completed_at = Some(Utc::now());
        self.archive(id);
    }
}

struct DistributorInner {
    config: DistributorConfig,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    strategy: StrategyEngine,
    state: Mutex<DistributorState>,
    wake: Notify,
    finished: Notify,
}

/// Places workspace tasks on workspaces, provisioning new ones on demand.
#[derive(Clone)]
pub struct WorkspaceDistributor {
    inner: Arc<DistributorInner>,
}

impl WorkspaceDistributor {
    pub fn new(config: DistributorConfig, provisioner: Arc<dyn WorkspaceProvisioner>) -> Self {
        let state = DistributorState {
            workspaces: BTreeMap::new(),
            tasks: HashMap::new(),
            history: VecDeque::new(),
            history_limit: config.history_limit,
            outcomes: HashMap::new(),
            outcome_order: VecDeque::new(),
            totals: TerminalTotals::default(),
            waiting: TaskQueue::new(config.queue_capacity),
            graph: DependencyGraph::new(),
            next_seq: 0,
            next_workspace: 1,
        };
        Self {
            inner: Arc::new(DistributorInner {
                strategy: StrategyEngine::new(config.strategy),
                config,
                provisioner,
                state: Mutex::new(state),
                wake: Notify::new(),
                finished: Notify::new(),
            }),
        }
    }

    /// Accept a workspace task; it is assigned immediately when its
    /// dependencies are met and a workspace has room. A task that cannot be
    /// placed yet, including when provisioning fails, stays queued.
    pub async fn distribute(&self, request: DistributeRequest) -> TaskforgeResult<TaskId> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;

        let id = request.id.unwrap_or_else(Uuid::new_v4);
        if state.status_of(&id).is_some() {
            return Err(TaskforgeError::Workspace(format!(
                "Workspace task {id} already exists"
            )));
        }
        if request.task_type.trim().is_empty() {
            return Err(TaskforgeError::Workspace(
                "Workspace task type must not be empty".into(),
            ));
        }

        let mut dependencies = request.dependencies;
        dependencies.sort();
        dependencies.dedup();
        let mut unmet = Vec::new();
        for dep in &dependencies {
            match state.status_of(dep) {
                Some(WorkspaceTaskStatus::Completed) => {}
                Some(status @ (WorkspaceTaskStatus::Failed | WorkspaceTaskStatus::Cancelled)) => {
                    return Err(TaskforgeError::Dependency(format!(
                        "Dependency {dep} already {status:?}"
                    )));
                }
                // Unknown ids are forward references to tasks not distributed yet.
                _ => unmet.push(*dep),
            }
        }
        if state.graph.would_cycle(id, &unmet) {
            return Err(TaskforgeError::Dependency(format!(
                "Task {id} would create a dependency cycle"
            )));
        }
        let waiting = state.waiting.len() + state.graph.blocked_count();
        if waiting >= self.inner.config.queue_capacity {
            return Err(TaskforgeError::Capacity(format!(
                "Workspace queue is full ({waiting} tasks waiting)"
            )));
        }

        let sequence = state.next_seq;
        state.next_seq += 1;
        let task = WorkspaceTask {
            id,
            task_type: request.task_type,
            description: request.description,
            requirements: request.requirements,
            priority: request.priority,
            dependencies,
            strategy: request.strategy,
            status: WorkspaceTaskStatus::Pending,
            workspace_id: None,
            branch: None,
            forced: false,
            created_at: Utc::now(),
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
            sequence,
        };
        debug!(task_id = %id, task_type = %task.task_type, waiting_on = unmet.len(), "Workspace task distributed");
        state.tasks.insert(id, task);

        if unmet.is_empty() {
            self.make_ready(state, id).await?;
        } else {
            state.graph.block(id, unmet);
        }
        Ok(id)
    }

    /// Queue a task whose dependencies are met and try to place it.
    async fn make_ready(&self, state: &mut DistributorState, id: TaskId) -> TaskforgeResult<()> {
        if let Err(e) = enqueue(state, id) {
            state.tasks.remove(&id);
            return Err(e);
        }
        match self.try_assign(state, id).await {
            Ok(true) => {
                state.waiting.remove(&id);
            }
            Ok(false) => {}
            Err(e) => warn!(task_id = %id, error = %e, "Workspace assignment failed, task stays queued"),
        }
        Ok(())
    }

    /// Place a queued task. Returns false when it has to keep waiting.
    async fn try_assign(&self, state: &mut DistributorState, id: TaskId) -> TaskforgeResult<bool> {
        let Some(task) = state.tasks.get(&id) else {
            return Ok(false);
        };
        let task_type = task.task_type.clone();
        let strategy = task.strategy.unwrap_or(self.inner.config.strategy);
        let profile = TaskProfile {
            kind: &task_type,
            priority: task.priority,
        };

        let candidates: Vec<Candidate> = state.workspaces.values().map(|w| w.candidate()).collect();
        let picked = self
            .inner
            .strategy
            .pick_with(strategy, &candidates, &profile)
            .map(|i| candidates[i].id.clone());

        let workspace_id = match picked {
            Some(ws) => ws,
            None if self.inner.config.auto_provision
                && state.workspaces.len() < self.inner.config.max_workspaces =>
            {
                self.provision_in(state, Some(task_type)).await?
            }
            None => return Ok(false),
        };
        self.assign(state, id, &workspace_id, false);
        Ok(true)
    }

    fn assign(&self, state: &mut DistributorState, id: TaskId, workspace_id: &str, forced: bool) {
        let (Some(task), Some(workspace)) =
            (state.tasks.get_mut(&id), state.workspaces.get_mut(workspace_id))
        else {
            return;
        };
        workspace.current_load += 1;
        workspace.last_activity = Utc::now();
        if workspace.current_load > workspace.max_load {
            warn!(
                task_id = %id,
                workspace = %workspace_id,
                load = workspace.current_load,
                max_load = workspace.max_load,
                "Workspace load forced past its maximum"
            );
        }

        let branch = branch_name(&self.inner.config.branch_prefix, &task.task_type, &id);
        task.status = WorkspaceTaskStatus::Assigned;
        task.workspace_id = Some(workspace_id.to_string());
        task.branch = Some(branch.clone());
        task.forced = forced;
        task.assigned_at = Some(Utc::now());
        info!(
            task_id = %id,
            workspace = %workspace_id,
            branch = %branch,
            load = workspace.current_load,
            "Workspace task assigned"
        );
    }

    async fn provision_in(
        &self,
        state: &mut DistributorState,
        specialization: Option<String>,
    ) -> TaskforgeResult<String> {
        let workspace_id = format!("ws-{:03}", state.next_workspace);
        state.next_workspace += 1;
        let branch = format!("{}/workspace/{workspace_id}", self.inner.config.branch_prefix);
        let path = self
            .inner
            .provisioner
            .provision(&workspace_id, &branch)
            .await?;

        let mut workspace = WorkspaceCapability::new(
            workspace_id.clone(),
            specialization,
            branch,
            self.inner.config.workspace_max_load,
        );
        workspace.path = path;
        info!(
            workspace = %workspace_id,
            specialization = ?workspace.specialization,
            "Provisioned workspace"
        );
        state.workspaces.insert(workspace_id.clone(), workspace);
        Ok(workspace_id)
    }

    /// Provision a workspace explicitly, e.g. to pre-warm a specialization.
    pub async fn provision(&self, specialization: Option<String>) -> TaskforgeResult<String> {
        let mut guard = self.inner.state.lock().await;
        if guard.workspaces.len() >= self.inner.config.max_workspaces {
            return Err(TaskforgeError::Capacity(format!(
                "Workspace limit of {} reached",
                self.inner.config.max_workspaces
            )));
        }
        let workspace_id = self.provision_in(&mut guard, specialization).await?;
        self.drain_waiting(&mut guard).await;
        Ok(workspace_id)
    }

    /// Assign a queued task to a specific workspace. With `force`, the
    /// workspace may exceed its max load; that override is logged.
    pub async fn assign_to(
        &self,
        id: &TaskId,
        workspace_id: &str,
        force: bool,
    ) -> TaskforgeResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let status = state
            .tasks
            .get(id)
            .map(|t| t.status)
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown workspace task {id}")))?;
        if status != WorkspaceTaskStatus::Queued {
            return Err(TaskforgeError::InvalidTransition {
                from: format!("{status:?}").to_lowercase(),
                to: "assigned".into(),
            });
        }
        let workspace = state
            .workspaces
            .get(workspace_id)
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown workspace {workspace_id}")))?;
        let full = !workspace.candidate().has_room();
        if full && !force {
            return Err(TaskforgeError::Capacity(format!(
                "Workspace {workspace_id} is at max load {}",
                workspace.max_load
            )));
        }
        state.waiting.remove(id);
        self.assign(state, *id, workspace_id, full);
        Ok(())
    }

    /// Record the outcome of an assigned task, release its workspace slot and
    /// release or fail its dependents.
    pub async fn complete(
        &self,
        id: &TaskId,
        result: Result<serde_json::Value, String>,
    ) -> TaskforgeResult<()> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown workspace task {id}")))?;
        if task.status != WorkspaceTaskStatus::Assigned {
            return Err(TaskforgeError::InvalidTransition {
                from: format!("{:?}", task.status).to_lowercase(),
                to: "completed".into(),
            });
        }

        let now = Utc::now();
        let duration_ms = task
            .assigned_at
            .map(|t| (now - t).num_milliseconds().max(0) as u64)
            .unwrap_or(0);
        let success = result.is_ok();
        match result {
            Ok(value) => {
                task.status = WorkspaceTaskStatus::Completed;
                task.result = Some(value);
            }
            Err(reason) => {
                task.status = WorkspaceTaskStatus::Failed;
                task.error = Some(reason);
            }
        }
        task.completed_at = Some(now);
        let task_type = task.task_type.clone();
        let workspace_id = task.workspace_id.clone();
        state.archive(*id);

        if let Some(workspace) = workspace_id.as_ref().and_then(|w| state.workspaces.get_mut(w)) {
            workspace.current_load = workspace.current_load.saturating_sub(1);
            workspace.record_completion(&task_type, duration_ms, success);
        }
        info!(
            task_id = %id,
            workspace = ?workspace_id,
            success,
            duration_ms,
            "Workspace task finished"
        );

        self.cascade(state, *id, success);
        self.drain_waiting(state).await;
        drop(guard);
        self.inner.finished.notify_waiters();
        Ok(())
    }

    fn cascade(&self, state: &mut DistributorState, id: TaskId, success: bool) {
        if success {
            // Released tasks only join the queue; the caller drains it in priority order.
            for ready in state.graph.complete(&id) {
                if let Err(e) = enqueue(state, ready) {
                    warn!(task_id = %ready, error = %e, "Released workspace task cannot be queued");
                    state.fail(ready, format!("released into a full queue: {e}"));
                    self.cascade(state, ready, false);
                }
            }
        } else {
            for doomed in state.graph.fail(&id) {
                warn!(task_id = %doomed, dependency = %id, "Dependency failed, workspace task failed");
                state.fail(doomed, format!("dependency {id} did not complete"));
            }
        }
    }

    /// Try to place every waiting task, in priority order.
    async fn drain_waiting(&self, state: &mut DistributorState) -> usize {
        let ids: Vec<TaskId> = state.waiting.iter().collect();
        let mut placed = 0;
        for id in ids {
            match self.try_assign(state, id).await {
                Ok(true) => {
                    state.waiting.remove(&id);
                    placed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(task_id = %id, error = %e, "Workspace assignment failed"),
            }
        }
        placed
    }

    pub async fn cancel(&self, id: &TaskId) -> TaskforgeResult<CancelAck> {
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        let task = state
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown workspace task {id}")))?;
        if task.status.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal(task.status.into()));
        }
        let previous = task.status;
        task.status = WorkspaceTaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        task.error = Some("cancelled by caller".into());
        let workspace_id = task.workspace_id.clone();
        state.archive(*id);

        match previous {
            WorkspaceTaskStatus::Pending => state.graph.remove(id),
            WorkspaceTaskStatus::Queued => {
                state.waiting.remove(id);
            }
            WorkspaceTaskStatus::Assigned => {
                if let Some(ws) = workspace_id.as_ref().and_then(|w| state.workspaces.get_mut(w)) {
                    ws.current_load = ws.current_load.saturating_sub(1);
                    ws.last_activity = Utc::now();
                }
            }
            _ => {}
        }
        info!(task_id = %id, "Workspace task cancelled");
        self.cascade(state, *id, false);
        if previous == WorkspaceTaskStatus::Assigned {
            self.drain_waiting(state).await;
        }
        drop(guard);
        self.inner.finished.notify_waiters();
        Ok(CancelAck::Cancelled)
    }

    pub async fn status(&self, id: &TaskId) -> TaskforgeResult<WorkspaceTask> {
        self.inner
            .state
            .lock()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown workspace task {id}")))
    }

    pub async fn wait_for(&self, id: &TaskId, timeout: Duration) -> TaskforgeResult<WorkspaceTask> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self.status(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TaskforgeError::Timeout(format!(
                    "Workspace task {id} not finished after {}ms",
                    timeout.as_millis()
                )));
            }
        }
    }

    pub async fn workspaces(&self) -> Vec<WorkspaceCapability> {
        self.inner
            .state
            .lock()
            .await
            .workspaces
            .values()
            .cloned()
            .collect()
    }

    /// Reclaim workspaces with zero load idle since before `now - idle_timeout`.
    pub async fn reclaim_idle_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let idle_timeout = chrono::Duration::from_std(self.inner.config.idle_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut guard = self.inner.state.lock().await;
        let idle: Vec<String> = guard
            .workspaces
            .values()
            .filter(|w| w.current_load == 0 && now - w.last_activity >= idle_timeout)
            .map(|w| w.id.clone())
            .collect();

        let mut reclaimed = Vec::new();
        for id in idle {
            let Some(workspace) = guard.workspaces.remove(&id) else {
                continue;
            };
            if let Err(e) = self.inner.provisioner.reclaim(&id, &workspace.branch).await {
                warn!(workspace = %id, error = %e, "Failed to reclaim workspace");
            }
            info!(workspace = %id, "Reclaimed idle workspace");
            reclaimed.push(id);
        }
        reclaimed
    }

    pub async fn reclaim_idle(&self) -> Vec<String> {
        self.reclaim_idle_at(Utc::now()).await
    }

    pub async fn statistics(&self) -> DistributorStats {
        let state = self.inner.state.lock().await;
        let mut stats = DistributorStats {
            workspaces: state.workspaces.len(),
            ..DistributorStats::default()
        };
        for w in state.workspaces.values() {
            stats.total_load += w.current_load;
            stats.total_capacity += w.max_load;
            stats.avg_performance += w.performance_score;
        }
        if stats.workspaces > 0 {
            stats.avg_performance /= stats.workspaces as f64;
        }
        for task in state.tasks.values() {
            match task.status {
                WorkspaceTaskStatus::Pending => stats.pending += 1,
                WorkspaceTaskStatus::Queued => stats.queued += 1,
                WorkspaceTaskStatus::Assigned => stats.assigned += 1,
                _ => {}
            }
        }
        stats.completed = state.totals.completed as usize;
        stats.failed = state.totals.failed as usize;
        stats.cancelled = state.totals.cancelled as usize;
        stats
    }

    /// Run placement and idle reclamation until `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let distributor = self.clone();
        let tick = self.inner.config.tick_interval();
        tokio::spawn(async move {
            info!("Workspace distributor loop started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = distributor.inner.wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
                {
                    let mut guard = distributor.inner.state.lock().await;
                    distributor.drain_waiting(&mut guard).await;
                }
                distributor.reclaim_idle().await;
            }
            info!("Workspace distributor loop stopped");
        })
    }

    /// Ask the loop to run a placement pass now.
    pub fn nudge(&self) {
        self.inner.wake.notify_one();
    }
}

fn enqueue(state: &mut DistributorState, id: TaskId) -> TaskforgeResult<()> {
    let Some((priority, sequence)) = state.tasks.get(&id).map(|t| (t.priority, t.sequence)) else {
        return Ok(());
    };
    state.waiting.push(id, priority, sequence)?;
    if let Some(task) = state.tasks.get_mut(&id) {
        task.status = WorkspaceTaskStatus::Queued;
    }
    Ok(())
}

/// `<prefix>/<task type>/<first 8 chars of the id>`, with the type reduced to
/// lowercase alphanumerics and dashes.
fn branch_name(prefix: &str, task_type: &str, id: &TaskId) -> String {
    let mut kind: String = task_type
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    while kind.contains("--") {
        kind = kind.replace("--", "-");
    }
    let kind = kind.trim_matches('-');
    let kind = if kind.is_empty() { "task" } else { kind };
    let short: String = id.simple().to_string().chars().take(8).collect();
    format!("{prefix}/{kind}/{short}")
}

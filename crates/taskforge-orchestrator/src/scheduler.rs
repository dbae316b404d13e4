//! Priority scheduler: accepts tasks, parks them on unmet dependencies, and
//! dispatches ready tasks to pooled worker instances.
//!
//! All scheduler state sits behind one mutex that is never held across an
//! `.await`. Execution runs in its own tokio task per dispatched task; the
//! per-kind pool ceiling is the backpressure, so a saturated kind leaves its
//! tasks waiting in the queue.

use crate::config::SchedulerConfig;
use crate::dependency::DependencyGraph;
use crate::factory::{PoolUtilization, WorkerFactory, WorkerHandle};
use crate::history::HistorySink;
use crate::monitor::WorkerMonitor;
use crate::store::TaskStore;
use crate::strategy::{Candidate, StrategyEngine, TaskProfile};
use crate::swarm::Failure;
use crate::task_queue::TaskQueue;
use crate::types::{
    CancelAck, StatusReport, SubmitRequest, Task, TaskRecord, TaskStatus, TaskTarget,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge_core::{
    ErrorKind, FailurePriority, Priority, TaskId, TaskforgeError, TaskforgeResult,
};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters returned by [`Scheduler::statistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks queued and ready for a worker.
    pub queue_depth: usize,
    /// Tasks parked on unmet dependencies.
    pub pending: usize,
    /// Tasks assigned or executing.
    pub active: usize,
    /// Tasks that finished successfully, including evicted history.
    pub completed: u64,
    /// Tasks that ended in failure, timeouts and dependency cascades included.
    pub failed: u64,
    /// Tasks cancelled before or during execution.
    pub cancelled: u64,
    /// Pool occupancy per registered kind.
    pub per_kind: Vec<PoolUtilization>,
    /// Success ratio across kinds; 1.0 before any task finishes.
    pub health_score: f64,
}

struct RunningTask {
    cancel: CancellationToken,
}

struct SchedulerState {
    store: TaskStore,
    queue: TaskQueue,
    graph: DependencyGraph,
    running: HashMap<TaskId, RunningTask>,
    /// Not eligible for dispatch before this instant.
    backoff: HashMap<TaskId, Instant>,
    dispatch_attempts: HashMap<TaskId, u32>,
    next_seq: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    factory: Arc<WorkerFactory>,
    monitor: Arc<WorkerMonitor>,
    strategy: StrategyEngine,
    state: Mutex<SchedulerState>,
    wake: Notify,
    finished: Notify,
    sink: Option<Arc<dyn HistorySink>>,
    failures: Option<mpsc::UnboundedSender<Failure>>,
}

enum Outcome {
    Completed(serde_json::Value),
    Failed(TaskforgeError),
    TimedOut(Duration),
    Cancelled(String),
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    factory: Arc<WorkerFactory>,
    monitor: Arc<WorkerMonitor>,
    sink: Option<Arc<dyn HistorySink>>,
    failures: Option<mpsc::UnboundedSender<Failure>>,
}

impl SchedulerBuilder {
    /// Send every finished task record to `sink`.
    pub fn history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Forward failures of `auto_heal` tasks to `tx`.
    pub fn failure_channel(mut self, tx: mpsc::UnboundedSender<Failure>) -> Self {
        self.failures = Some(tx);
        self
    }

    pub fn build(self) -> Scheduler {
        let state = SchedulerState {
            store: TaskStore::new(self.config.history_limit),
            queue: TaskQueue::new(self.config.queue_capacity),
            graph: DependencyGraph::new(),
            running: HashMap::new(),
            backoff: HashMap::new(),
            dispatch_attempts: HashMap::new(),
            next_seq: 0,
        };
        Scheduler {
            inner: Arc::new(SchedulerInner {
                strategy: StrategyEngine::new(self.config.capability_strategy),
                config: self.config,
                factory: self.factory,
                monitor: self.monitor,
                state: Mutex::new(state),
                wake: Notify::new(),
                finished: Notify::new(),
                sink: self.sink,
                failures: self.failures,
            }),
        }
    }
}

/// Cheap-to-clone handle to the task scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn builder(
        config: SchedulerConfig,
        factory: Arc<WorkerFactory>,
        monitor: Arc<WorkerMonitor>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            factory,
            monitor,
            sink: None,
            failures: None,
        }
    }

    pub fn new(
        config: SchedulerConfig,
        factory: Arc<WorkerFactory>,
        monitor: Arc<WorkerMonitor>,
    ) -> Self {
        Self::builder(config, factory, monitor).build()
    }

    /// Accept a task and return its id without waiting for execution.
    pub fn submit(&self, request: SubmitRequest) -> TaskforgeResult<TaskId> {
        self.submit_attempt(request, None)
    }

    fn submit_attempt(
        &self,
        request: SubmitRequest,
        attempt_of: Option<(TaskId, u32)>,
    ) -> TaskforgeResult<TaskId> {
        let registry = self.inner.factory.registry();
        match &request.target {
            TaskTarget::Kind(kind) if !registry.contains(kind) => {
                return Err(TaskforgeError::NotFound(format!(
                    "Unknown worker kind '{kind}'"
                )));
            }
            TaskTarget::Capability(cap) if registry.find_by_capability(cap).is_empty() => {
                return Err(TaskforgeError::NotFound(format!(
                    "No worker kind offers capability '{cap}'"
                )));
            }
            _ => {}
        }

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let waiting = state.queue.len() + state.graph.blocked_count();
        if waiting >= self.inner.config.queue_capacity {
            return Err(TaskforgeError::Capacity(format!(
                "Scheduler is full ({waiting} tasks waiting)"
            )));
        }

        let mut task = Task::from_request(request, state.next_seq);
        if let Some((original, retry_count)) = attempt_of {
            task.attempt_of = Some(original);
            task.retry_count = retry_count;
        }

        let mut unmet = Vec::new();
        for dep in &task.dependencies {
            let Some(dep_task) = state.store.get(dep) else {
                return Err(TaskforgeError::Dependency(format!(
                    "Unknown dependency {dep}"
                )));
            };
            match dep_task.status {
                TaskStatus::Completed => {}
                TaskStatus::Failed | TaskStatus::Cancelled => {
                    return Err(TaskforgeError::Dependency(format!(
                        "Dependency {dep} already {}",
                        dep_task.status
                    )));
                }
                _ => unmet.push(*dep),
            }
        }

        state.next_seq += 1;
        let id = task.id;
        if unmet.is_empty() {
            task.transition(TaskStatus::Queued)?;
            state.queue.push(id, task.priority, task.sequence)?;
        } else {
            state.graph.block(id, unmet.iter().copied());
        }
        debug!(
            task_id = %id,
            kind = %task.kind_label(),
            priority = %task.priority,
            waiting_on = unmet.len(),
            "Task submitted"
        );
        state.store.insert(task);
        drop(guard);

        self.inner.wake.notify_one();
        Ok(id)
    }

    pub fn status(&self, id: &TaskId) -> TaskforgeResult<StatusReport> {
        self.inner
            .state
            .lock()
            .store
            .get(id)
            .map(StatusReport::from)
            .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown task {id}")))
    }

    pub fn task(&self, id: &TaskId) -> Option<Task> {
        self.inner.state.lock().store.get(id).cloned()
    }

    /// Cancel a task. Waiting tasks are cancelled at once; running tasks get
    /// their cancellation token fired and finish when the worker yields.
    pub fn cancel(&self, id: &TaskId) -> TaskforgeResult<CancelAck> {
        let (ack, terminal) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let task = state
                .store
                .get_mut(id)
                .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown task {id}")))?;

            match task.status {
                status if status.is_terminal() => (CancelAck::AlreadyTerminal(status), Vec::new()),
                TaskStatus::Pending | TaskStatus::Queued => {
                    task.transition(TaskStatus::Cancelled)?;
                    task.error = Some("cancelled by caller".into());
                    task.error_kind = Some(ErrorKind::Cancelled);
                    state.queue.remove(id);
                    state.graph.remove(id);
                    state.backoff.remove(id);
                    state.dispatch_attempts.remove(id);
                    info!(task_id = %id, "Task cancelled before dispatch");
                    (CancelAck::Cancelled, settle(state, *id))
                }
                _ => {
                    if let Some(running) = state.running.get(id) {
                        running.cancel.cancel();
                    }
                    info!(task_id = %id, "Cancellation requested for running task");
                    (CancelAck::CancellationRequested, Vec::new())
                }
            }
        };
        self.finalize(terminal);
        Ok(ack)
    }

    /// Start a new attempt of a failed or cancelled task.
    pub fn retry(&self, id: &TaskId) -> TaskforgeResult<TaskId> {
        let (request, retry_count) = {
            let state = self.inner.state.lock();
            let task = state
                .store
                .get(id)
                .ok_or_else(|| TaskforgeError::NotFound(format!("Unknown task {id}")))?;
            if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
                return Err(TaskforgeError::InvalidTransition {
                    from: task.status.to_string(),
                    to: "retry".into(),
                });
            }
            let mut request = SubmitRequest::new(task.target.clone())
                .with_payload(task.payload.clone())
                .with_priority(task.priority)
                .depends_on(task.dependencies.clone())
                .auto_heal(task.auto_heal);
            if let Some(ms) = task.timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }
            (request, task.retry_count + 1)
        };
        let new_id = self.submit_attempt(request, Some((*id, retry_count)))?;
        info!(task_id = %new_id, attempt_of = %id, retry_count, "Task retried");
        Ok(new_id)
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait_for(&self, id: &TaskId, timeout: Duration) -> TaskforgeResult<StatusReport> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let report = self.status(id)?;
            if report.state.is_terminal() {
                return Ok(report);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TaskforgeError::Timeout(format!(
                    "Task {id} still {} after {}ms",
                    report.state,
                    timeout.as_millis()
                )));
            }
        }
    }

    pub fn statistics(&self) -> SchedulerStats {
        let (queue_depth, pending, active, totals) = {
            let state = self.inner.state.lock();
            (
                state.queue.len(),
                state.graph.blocked_count(),
                state.store.active_count(),
                state.store.totals(),
            )
        };
        SchedulerStats {
            queue_depth,
            pending,
            active,
            completed: totals.completed,
            failed: totals.failed,
            cancelled: totals.cancelled,
            per_kind: self.inner.factory.utilization(),
            health_score: self.inner.monitor.health_score(),
        }
    }

    /// Most recent finished tasks, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Task> {
        self.inner
            .state
            .lock()
            .store
            .recent(limit)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Dispatch every queued task that can get a worker right now.
    ///
    /// Walks the queue in priority order. A kind at its pool ceiling is
    /// skipped for the rest of the pass; acquire errors back the task off and
    /// fail it once `dispatch_retries` is exhausted.
    pub fn dispatch_ready(&self) -> usize {
        let now = Instant::now();
        let mut launches = Vec::new();
        let mut terminal = Vec::new();
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let mut saturated: HashSet<String> = HashSet::new();
            let ids: Vec<TaskId> = state.queue.iter().collect();

            for id in ids {
                if state.backoff.get(&id).is_some_and(|until| *until > now) {
                    continue;
                }
                let Some(task) = state.store.get(&id) else {
                    state.queue.remove(&id);
                    continue;
                };

                let kind = match self.resolve_kind(task, &saturated) {
                    Ok(Some(kind)) => kind,
                    Ok(None) => continue,
                    Err(e) => {
                        terminal.extend(self.record_dispatch_failure(state, id, e, now));
                        continue;
                    }
                };
                if saturated.contains(&kind) {
                    continue;
                }

                match self.inner.factory.try_acquire(&kind, None) {
                    Ok(Some(handle)) => {
                        let Some(task) = state.store.get_mut(&id) else {
                            self.inner.factory.release(handle);
                            continue;
                        };
                        if let Err(e) = task.transition(TaskStatus::Assigned) {
                            error!(task_id = %id, error = %e, "Queued task in unexpected state");
                            self.inner.factory.release(handle);
                            state.queue.remove(&id);
                            continue;
                        }
                        task.kind = Some(kind);
                        task.assigned_worker = Some(handle.instance_id);
                        state.queue.remove(&id);
                        state.backoff.remove(&id);
                        state.dispatch_attempts.remove(&id);
                        let cancel = CancellationToken::new();
                        state.running.insert(
                            id,
                            RunningTask {
                                cancel: cancel.clone(),
                            },
                        );
                        launches.push((task.clone(), handle, cancel));
                    }
                    Ok(None) => {
                        saturated.insert(kind);
                    }
                    Err(e) => {
                        terminal.extend(self.record_dispatch_failure(state, id, e, now));
                    }
                }
            }
        }

        self.finalize(terminal);
        let dispatched = launches.len();
        for (task, handle, cancel) in launches {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_task(task, handle, cancel).await });
        }
        dispatched
    }

    /// Worker kind for a queued task; `Ok(None)` when every candidate is full.
    fn resolve_kind(
        &self,
        task: &Task,
        saturated: &HashSet<String>,
    ) -> TaskforgeResult<Option<String>> {
        let cap = match &task.target {
            TaskTarget::Kind(kind) => return Ok(Some(kind.clone())),
            TaskTarget::Capability(cap) => cap,
        };
        let factory = &self.inner.factory;
        let kinds = factory.registry().find_by_capability(cap);
        if kinds.is_empty() {
            return Err(TaskforgeError::Capacity(format!(
                "No worker kind offers capability '{cap}'"
            )));
        }
        let candidates: Vec<Candidate> = kinds
            .iter()
            .filter(|k| !saturated.contains(*k))
            .filter_map(|k| {
                let ceiling = factory.ceiling(k)?;
                let mut candidate = Candidate::new(k.clone(), factory.busy_count(k), ceiling)
                    .with_performance(self.inner.monitor.performance(k));
                candidate.error_rate = self.inner.monitor.error_rate(k);
                Some(candidate)
            })
            .collect();
        let profile = TaskProfile {
            kind: cap.as_str(),
            priority: task.priority,
        };
        Ok(self
            .inner
            .strategy
            .pick(&candidates, &profile)
            .map(|i| candidates[i].id.clone()))
    }

    fn record_dispatch_failure(
        &self,
        state: &mut SchedulerState,
        id: TaskId,
        cause: TaskforgeError,
        now: Instant,
    ) -> Vec<Task> {
        let attempts = {
            let counter = state.dispatch_attempts.entry(id).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempts <= self.inner.config.dispatch_retries {
            let delay = compute_backoff(&self.inner.config, attempts);
            state
                .backoff
                .insert(id, now + Duration::from_millis(delay));
            warn!(task_id = %id, attempt = attempts, delay_ms = delay, error = %cause, "Dispatch failed, backing off");
            return Vec::new();
        }

        state.queue.remove(&id);
        state.backoff.remove(&id);
        state.dispatch_attempts.remove(&id);
        let Some(task) = state.store.get_mut(&id) else {
            return Vec::new();
        };
        if let Err(e) = task.fail(format!("no worker available: {cause}"), ErrorKind::Capacity) {
            error!(task_id = %id, error = %e, "Cannot fail task");
            return Vec::new();
        }
        warn!(task_id = %id, attempts, "Task failed: no worker available");
        settle(state, id)
    }

    async fn run_task(&self, task: Task, handle: WorkerHandle, cancel: CancellationToken) {
        let id = task.id;
        let kind = handle.kind.clone();

        let started = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.store.get_mut(&id) {
                Some(t) if !cancel.is_cancelled() => t.transition(TaskStatus::InProgress).map(|_| t.clone()),
                Some(_) => Err(TaskforgeError::Cancelled("cancelled before start".into())),
                None => Err(TaskforgeError::NotFound(format!("Unknown task {id}"))),
            }
        };
        let snapshot = match started {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.inner.factory.release(handle);
                let reason = match e {
                    TaskforgeError::Cancelled(reason) => reason,
                    other => other.to_string(),
                };
                self.finish(id, &kind, Outcome::Cancelled(reason), 0);
                return;
            }
        };

        self.inner.monitor.record_start(&kind);
        info!(
            task_id = %id,
            kind = %kind,
            instance_id = %handle.instance_id,
            priority = %snapshot.priority,
            "Task dispatched"
        );

        let budget = snapshot
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.default_task_timeout());
        let clock = Instant::now();
        let result = tokio::time::timeout(
            budget,
            handle.worker.execute(&snapshot, cancel.child_token()),
        )
        .await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(value)) => Outcome::Completed(value),
            Ok(Err(TaskforgeError::Cancelled(reason))) => Outcome::Cancelled(reason),
            Ok(Err(e)) if cancel.is_cancelled() => {
                Outcome::Cancelled(format!("cancelled by caller: {e}"))
            }
            Ok(Err(e)) => Outcome::Failed(e),
            Err(_) => Outcome::TimedOut(budget),
        };

        if matches!(outcome, Outcome::TimedOut(_)) {
            cancel.cancel();
            self.inner.factory.retire(handle).await;
        } else {
            self.inner.factory.release(handle);
        }
        self.finish(id, &kind, outcome, elapsed_ms);
    }

    fn finish(&self, id: TaskId, kind: &str, outcome: Outcome, elapsed_ms: u64) {
        let terminal = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            state.running.remove(&id);
            let Some(task) = state.store.get_mut(&id) else {
                return;
            };
            let applied = match outcome {
                Outcome::Completed(value) => {
                    self.inner.monitor.record_completed(kind, elapsed_ms);
                    task.transition(TaskStatus::Completed).map(|_| {
                        task.result = Some(value);
                        info!(task_id = %id, kind = %kind, elapsed_ms, "Task completed");
                    })
                }
                Outcome::Failed(e) => {
                    self.inner.monitor.record_failed(kind, elapsed_ms, false);
                    warn!(task_id = %id, kind = %kind, error = %e, "Task failed");
                    task.fail(e.to_string(), e.kind())
                }
                Outcome::TimedOut(budget) => {
                    self.inner.monitor.record_failed(kind, elapsed_ms, true);
                    warn!(task_id = %id, kind = %kind, timeout_ms = budget.as_millis() as u64, "Task timed out; instance retired");
                    task.fail(
                        format!("timed out after {}ms", budget.as_millis()),
                        ErrorKind::Timeout,
                    )
                }
                Outcome::Cancelled(reason) => {
                    self.inner.monitor.record_cancelled(kind);
                    info!(task_id = %id, kind = %kind, "Task cancelled");
                    task.transition(TaskStatus::Cancelled).map(|_| {
                        task.error = Some(reason);
                        task.error_kind = Some(ErrorKind::Cancelled);
                    })
                }
            };
            if let Err(e) = applied {
                error!(task_id = %id, error = %e, "Cannot record task outcome");
                return;
            }
            settle(state, id)
        };
        self.finalize(terminal);
        self.inner.wake.notify_one();
    }

    /// Publish terminal tasks: history sink, auto-heal forwarding, waiters.
    fn finalize(&self, terminal: Vec<Task>) {
        if terminal.is_empty() {
            return;
        }
        for task in &terminal {
            if let Some(sink) = &self.inner.sink {
                sink.record_task(&TaskRecord::from(task));
            }
            if let Some(failure) = healable_failure(task) {
                if let Some(tx) = &self.inner.failures {
                    if tx.send(failure).is_err() {
                        debug!(task_id = %task.id, "Failure handler is gone");
                    }
                }
            }
        }
        self.inner.finished.notify_waiters();
    }

    /// Cancel every running task, e.g. on shutdown.
    pub fn cancel_running(&self) -> usize {
        let state = self.inner.state.lock();
        for running in state.running.values() {
            running.cancel.cancel();
        }
        state.running.len()
    }

    /// Run the dispatch loop until `shutdown` fires.
    pub fn start(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let tick = self.inner.config.tick_interval();
        tokio::spawn(async move {
            info!("Scheduler loop started");
            loop {
                scheduler.dispatch_ready();
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = scheduler.inner.wake.notified() => {}
                    _ = tokio::time::sleep(tick) => {}
                }
            }
            info!("Scheduler loop stopped");
        })
    }
}

/// Bookkeeping after `id` became terminal: release or fail dependents and
/// move everything finished into history. Returns the tasks that became terminal.
fn settle(state: &mut SchedulerState, id: TaskId) -> Vec<Task> {
    let mut terminal = Vec::new();
    let Some(task) = state.store.get(&id) else {
        return terminal;
    };
    let status = task.status;
    terminal.push(task.clone());

    if status == TaskStatus::Completed {
        for ready in state.graph.complete(&id) {
            let Some(dependent) = state.store.get_mut(&ready) else {
                continue;
            };
            if dependent.transition(TaskStatus::Queued).is_ok() {
                let (priority, seq) = (dependent.priority, dependent.sequence);
                if let Err(e) = state.queue.push(ready, priority, seq) {
                    warn!(task_id = %ready, error = %e, "Cannot queue released dependent");
                }
                debug!(task_id = %ready, "Dependencies met, task queued");
            }
        }
    } else {
        for doomed in state.graph.fail(&id) {
            let Some(dependent) = state.store.get_mut(&doomed) else {
                continue;
            };
            if dependent
                .fail(format!("dependency {id} did not complete"), ErrorKind::Dependency)
                .is_ok()
            {
                warn!(task_id = %doomed, dependency = %id, "Dependency failed, task failed");
                terminal.push(dependent.clone());
            }
        }
    }

    for task in &terminal {
        for evicted in state.store.archive(task.id) {
            state.dispatch_attempts.remove(&evicted);
            state.backoff.remove(&evicted);
        }
    }
    terminal
}

fn compute_backoff(config: &SchedulerConfig, attempt: u32) -> u64 {
    let delay = config
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    delay.min(config.backoff_max_ms)
}

/// Failure to hand to the swarm workflow, for opted-in execution and timeout failures.
fn healable_failure(task: &Task) -> Option<Failure> {
    if !task.auto_heal || task.status != TaskStatus::Failed {
        return None;
    }
    let error_type = match task.error_kind? {
        ErrorKind::Execution => "execution_error",
        ErrorKind::Timeout => "timeout",
        _ => return None,
    };
    let priority = match task.priority {
        Priority::Critical => FailurePriority::Critical,
        Priority::High => FailurePriority::High,
        Priority::Medium => FailurePriority::Medium,
        Priority::Low | Priority::Deferred => FailurePriority::Low,
    };
    let mut failure = Failure::new(
        error_type,
        task.error.clone().unwrap_or_default(),
        task.kind_label(),
        priority,
    )
    .from_task(task.id);
    failure.context = task.payload.clone();
    Some(failure)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::registry::{Capability, WorkerCategory, WorkerDescriptor, WorkerRegistry};
    use crate::worker::{worker_builder, Worker, WorkerBuilder};
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
            Err(TaskforgeError::Execution("boom".into()))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Worker for Sleepy {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        }
    }

    struct Unbuildable;

    impl WorkerBuilder for Unbuildable {
        fn build(
            &self,
            _instance_id: uuid::Uuid,
            _config: Option<&serde_json::Value>,
        ) -> TaskforgeResult<Arc<dyn Worker>> {
            Err(TaskforgeError::Config("license server unreachable".into()))
        }
    }

    fn scheduler(config: SchedulerConfig) -> (Scheduler, mpsc::UnboundedReceiver<Failure>) {
        let registry = Arc::new(WorkerRegistry::new());
        registry
            .register(
                WorkerDescriptor::new("echo", WorkerCategory::General)
                    .with_capability(Capability::Execution)
                    .with_instances(0, 2),
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
            .register(
                WorkerDescriptor::new("sleepy", WorkerCategory::General).with_instances(0, 1),
                worker_builder(|| Sleepy),
            )
            .unwrap();
        registry
            .register(
                WorkerDescriptor::new("unbuildable", WorkerCategory::General)
                    .with_instances(0, 1),
                Arc::new(Unbuildable),
            )
            .unwrap();
        let factory = Arc::new(WorkerFactory::new(registry, PoolConfig::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::builder(config, factory, Arc::new(WorkerMonitor::new()))
            .failure_channel(tx)
            .build();
        (scheduler, rx)
    }

    #[test]
    fn test_submit_unknown_kind() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let err = scheduler.submit(SubmitRequest::new("ghost")).unwrap_err();
        assert!(matches!(err, TaskforgeError::NotFound(_)));
    }

    #[test]
    fn test_submit_rejects_when_full() {
        let config = SchedulerConfig {
            queue_capacity: 2,
            ..SchedulerConfig::default()
        };
        let (scheduler, _) = scheduler(config);
        scheduler.submit(SubmitRequest::new("echo")).unwrap();
        scheduler.submit(SubmitRequest::new("echo")).unwrap();
        let err = scheduler.submit(SubmitRequest::new("echo")).unwrap_err();
        assert!(matches!(err, TaskforgeError::Capacity(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let err = scheduler
            .submit(SubmitRequest::new("echo").depends_on(vec![uuid::Uuid::new_v4()]))
            .unwrap_err();
        assert!(matches!(err, TaskforgeError::Dependency(_)));
    }

    #[test]
    fn test_cancel_pending_cascades() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let first = scheduler.submit(SubmitRequest::new("echo")).unwrap();
        let second = scheduler
            .submit(SubmitRequest::new("echo").depends_on(vec![first]))
            .unwrap();
        let third = scheduler
            .submit(SubmitRequest::new("echo").depends_on(vec![second]))
            .unwrap();
        assert_eq!(scheduler.status(&third).unwrap().state, TaskStatus::Pending);

        assert_eq!(scheduler.cancel(&second).unwrap(), CancelAck::Cancelled);
        let report = scheduler.status(&third).unwrap();
        assert_eq!(report.state, TaskStatus::Failed);
        assert_eq!(
            report.error.as_deref(),
            Some(format!("dependency {second} did not complete").as_str())
        );
        assert_eq!(
            scheduler.cancel(&second).unwrap(),
            CancelAck::AlreadyTerminal(TaskStatus::Cancelled)
        );

        let err = scheduler
            .submit(SubmitRequest::new("echo").depends_on(vec![second]))
            .unwrap_err();
        assert!(matches!(err, TaskforgeError::Dependency(_)));
    }

    #[tokio::test]
    async fn test_dispatch_and_complete() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let id = scheduler
            .submit(SubmitRequest::new("echo").with_field("n", serde_json::json!(7)))
            .unwrap();
        assert_eq!(scheduler.dispatch_ready(), 1);
        let report = scheduler.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.state, TaskStatus::Completed);
        assert_eq!(report.result.unwrap()["n"], 7);
        assert_eq!(scheduler.statistics().completed, 1);
    }

    #[tokio::test]
    async fn test_capability_target_resolved() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let id = scheduler
            .submit(SubmitRequest::new(Capability::Execution))
            .unwrap();
        scheduler.dispatch_ready();
        let report = scheduler.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.state, TaskStatus::Completed);
        assert_eq!(report.kind, "echo");
    }

    #[tokio::test]
    async fn test_auto_heal_failure_forwarded() {
        let (scheduler, mut failures) = scheduler(SchedulerConfig::default());
        let id = scheduler
            .submit(SubmitRequest::new("broken").auto_heal(true))
            .unwrap();
        scheduler.dispatch_ready();
        let report = scheduler.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.state, TaskStatus::Failed);
        assert!(report.reason.contains("boom"));

        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.source_task, Some(id));
        assert_eq!(failure.error_type, "execution_error");
        assert_eq!(failure.component, "broken");
    }

    #[tokio::test]
    async fn test_timeout_fails_task_and_retires_instance() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let factory = scheduler.inner.factory.clone();
        let destroyed_before = factory.metrics().destroyed;
        let id = scheduler
            .submit(SubmitRequest::new("sleepy").with_timeout(Duration::from_millis(50)))
            .unwrap();
        assert_eq!(scheduler.dispatch_ready(), 1);
        assert_eq!(factory.instance_count("sleepy"), 1);

        let report = scheduler.wait_for(&id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(report.state, TaskStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("timed out after 50ms"));
        assert_eq!(scheduler.task(&id).unwrap().error_kind, Some(ErrorKind::Timeout));
        assert_eq!(factory.instance_count("sleepy"), 0);
        assert_eq!(factory.metrics().destroyed, destroyed_before + 1);
        assert_eq!(scheduler.statistics().failed, 1);
    }

    #[test]
    fn test_dispatch_gives_up_after_retries() {
        let config = SchedulerConfig {
            dispatch_retries: 0,
            ..SchedulerConfig::default()
        };
        let (scheduler, _) = scheduler(config);
        let id = scheduler.submit(SubmitRequest::new("unbuildable")).unwrap();
        let dependent = scheduler
            .submit(SubmitRequest::new("echo").depends_on(vec![id]))
            .unwrap();

        assert_eq!(scheduler.dispatch_ready(), 0);
        let report = scheduler.status(&id).unwrap();
        assert_eq!(report.state, TaskStatus::Failed);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .starts_with("no worker available:"));
        assert_eq!(scheduler.task(&id).unwrap().error_kind, Some(ErrorKind::Capacity));
        assert_eq!(scheduler.status(&dependent).unwrap().state, TaskStatus::Failed);
        assert_eq!(scheduler.statistics().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_retry_creates_new_attempt() {
        let (scheduler, _) = scheduler(SchedulerConfig::default());
        let id = scheduler.submit(SubmitRequest::new("broken")).unwrap();
        scheduler.dispatch_ready();
        scheduler.wait_for(&id, Duration::from_secs(2)).await.unwrap();

        let retry = scheduler.retry(&id).unwrap();
        assert_ne!(retry, id);
        let task = scheduler.task(&retry).unwrap();
        assert_eq!(task.attempt_of, Some(id));
        assert_eq!(task.retry_count, 1);
        assert_eq!(scheduler.status(&id).unwrap().state, TaskStatus::Failed);

        let err = scheduler.retry(&retry).unwrap_err();
        assert!(matches!(err, TaskforgeError::InvalidTransition { .. }));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = SchedulerConfig::default();
        assert_eq!(compute_backoff(&config, 1), 50);
        assert_eq!(compute_backoff(&config, 2), 100);
        assert_eq!(compute_backoff(&config, 3), 200);
        assert_eq!(compute_backoff(&config, 30), 5_000);
    }
}

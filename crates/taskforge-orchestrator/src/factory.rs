use crate::config::PoolConfig;
use crate::registry::WorkerRegistry;
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A reserved worker instance. Give it back with [`WorkerFactory::release`]
/// or destroy it with [`WorkerFactory::retire`].
pub struct WorkerHandle {
    pub instance_id: Uuid,
    pub kind: String,
    pub worker: Arc<dyn Worker>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("instance_id", &self.instance_id)
            .field("kind", &self.kind)
            .finish()
    }
}

struct PooledInstance {
    id: Uuid,
    worker: Arc<dyn Worker>,
    busy: bool,
    created_at: DateTime<Utc>,
    last_used: Instant,
    tasks_served: u64,
}

impl PooledInstance {
    fn handle(&self, kind: &str) -> WorkerHandle {
        WorkerHandle {
            instance_id: self.id,
            kind: kind.to_string(),
            worker: self.worker.clone(),
        }
    }
}

#[derive(Default)]
struct KindPool {
    instances: Vec<PooledInstance>,
    notify: Arc<Notify>,
}

impl KindPool {
    fn busy(&self) -> usize {
        self.instances.iter().filter(|i| i.busy).count()
    }
}

/// Snapshot of one pooled instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: Uuid,
    pub kind: String,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub idle_for_ms: u64,
    /// Runs this instance was released from, whatever their outcome.
    pub tasks_served: u64,
}

/// Pool occupancy for one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub kind: String,
    pub busy: usize,
    pub idle: usize,
    pub max_instances: usize,
    /// `busy / ceiling`, in 0..=1.
    pub utilization: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryMetrics {
    pub created: u64,
    pub destroyed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Acquires refused because the kind was at its ceiling.
    pub rejections: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    rejections: AtomicU64,
}

/// Creates and pools worker instances per kind.
///
/// Each kind has its own pool lock, so unrelated kinds never contend.
pub struct WorkerFactory {
    registry: Arc<WorkerRegistry>,
    config: PoolConfig,
    pools: RwLock<HashMap<String, Arc<Mutex<KindPool>>>>,
    counters: Counters,
}

impl WorkerFactory {
    pub fn new(registry: Arc<WorkerRegistry>, config: PoolConfig) -> Self {
        Self {
            registry,
            config,
            pools: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn pool(&self, kind: &str) -> Arc<Mutex<KindPool>> {
        if let Some(pool) = self.pools.read().get(kind) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(kind.to_string())
            .or_default()
            .clone()
    }

    /// Most instances the kind may hold at once, or `None` if it is unknown.
    pub fn ceiling(&self, kind: &str) -> Option<usize> {
        let descriptor = self.registry.descriptor(kind)?;
        Some(if self.config.auto_scale {
            descriptor.max_instances
        } else {
            descriptor.min_instances.max(1)
        })
    }

    /// Reserve an instance, reusing an idle one first.
    ///
    /// Returns `Ok(None)` when the kind is at its ceiling with nothing idle.
    pub fn try_acquire(
        &self,
        kind: &str,
        config: Option<&serde_json::Value>,
    ) -> TaskforgeResult<Option<WorkerHandle>> {
        let registered = self
            .registry
            .get(kind)
            .ok_or_else(|| TaskforgeError::Capacity(format!("Unknown worker kind '{kind}'")))?;
        let ceiling = self.ceiling(kind).unwrap_or(0);

        let pool = self.pool(kind);
        let mut pool = pool.lock();

        if let Some(instance) = pool.instances.iter_mut().find(|i| !i.busy) {
            instance.busy = true;
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(kind = %kind, instance_id = %instance.id, "Reused pooled worker");
            return Ok(Some(instance.handle(kind)));
        }

        if pool.instances.len() >= ceiling {
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let id = Uuid::new_v4();
        let worker = registered.builder.build(id, config)?;
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        let instance = PooledInstance {
            id,
            worker,
            busy: true,
            created_at: Utc::now(),
            last_used: Instant::now(),
            tasks_served: 0,
        };
        let handle = instance.handle(kind);
        pool.instances.push(instance);
        debug!(
            kind = %kind,
            instance_id = %id,
            total = pool.instances.len(),
            "Created worker instance"
        );
        Ok(Some(handle))
    }

    /// Reserve an instance or fail with a capacity error.
    pub fn acquire(
        &self,
        kind: &str,
        config: Option<&serde_json::Value>,
    ) -> TaskforgeResult<WorkerHandle> {
        self.try_acquire(kind, config)?.ok_or_else(|| {
            TaskforgeError::Capacity(format!("No worker instance available for kind '{kind}'"))
        })
    }

    /// Reserve an instance, waiting up to `timeout` for one to be released.
    pub async fn acquire_wait(&self, kind: &str, timeout: Duration) -> TaskforgeResult<WorkerHandle> {
        let deadline = tokio::time::Instant::now() + timeout;
        let notify = self.pool(kind).lock().notify.clone();
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.try_acquire(kind, None)? {
                return Ok(handle);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TaskforgeError::Timeout(format!(
                    "Waited {}ms for a '{kind}' worker instance",
                    timeout.as_millis()
                )));
            }
        }
    }

    /// Whether an acquire for `kind` would succeed right now.
    pub fn has_capacity(&self, kind: &str) -> bool {
        let Some(ceiling) = self.ceiling(kind) else {
            return false;
        };
        let pool = self.pool(kind);
        let pool = pool.lock();
        pool.instances.iter().any(|i| !i.busy) || pool.instances.len() < ceiling
    }

    /// Mark an instance idle without destroying it.
    pub fn release(&self, handle: WorkerHandle) {
        let pool = self.pool(&handle.kind);
        let mut pool = pool.lock();
        match pool
            .instances
            .iter_mut()
            .find(|i| i.id == handle.instance_id)
        {
            Some(instance) => {
                instance.busy = false;
                instance.last_used = Instant::now();
                instance.tasks_served += 1;
            }
            None => {
                warn!(
                    kind = %handle.kind,
                    instance_id = %handle.instance_id,
                    "Released an instance the pool no longer tracks"
                );
            }
        }
        pool.notify.notify_waiters();
    }

    /// Destroy an instance and run its cleanup hook. Cleanup errors are logged.
    pub async fn retire(&self, handle: WorkerHandle) {
        {
            let pool = self.pool(&handle.kind);
            let mut pool = pool.lock();
            pool.instances.retain(|i| i.id != handle.instance_id);
            pool.notify.notify_waiters();
        }
        self.destroy(&handle.kind, handle.instance_id, handle.worker)
            .await;
    }

    async fn destroy(&self, kind: &str, instance_id: Uuid, worker: Arc<dyn Worker>) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = worker.cleanup().await {
            warn!(kind = %kind, instance_id = %instance_id, error = %e, "Worker cleanup failed");
        } else {
            debug!(kind = %kind, instance_id = %instance_id, "Retired worker instance");
        }
    }

    /// Pre-create `min_instances` idle instances for every registered kind.
    pub fn warm_up(&self) -> TaskforgeResult<usize> {
        let mut created = 0;
        for descriptor in self.registry.descriptors() {
            let Some(registered) = self.registry.get(&descriptor.kind) else {
                continue;
            };
            let pool = self.pool(&descriptor.kind);
            let mut pool = pool.lock();
            while pool.instances.len() < descriptor.min_instances {
                let id = Uuid::new_v4();
                let worker = registered.builder.build(id, None)?;
                pool.instances.push(PooledInstance {
                    id,
                    worker,
                    busy: false,
                    created_at: Utc::now(),
                    last_used: Instant::now(),
                    tasks_served: 0,
                });
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                created += 1;
            }
        }
        if created > 0 {
            info!(instances = created, "Warmed up worker pools");
        }
        Ok(created)
    }

    /// Retire instances idle past the timeout, keeping `min_instances` per kind.
    pub async fn sweep_idle(&self, now: Instant) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let pools: Vec<(String, Arc<Mutex<KindPool>>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();

        let mut doomed = Vec::new();
        for (kind, pool) in pools {
            let floor = self
                .registry
                .descriptor(&kind)
                .map(|d| d.min_instances)
                .unwrap_or(0);
            let mut pool = pool.lock();
            let mut removable = pool.instances.len().saturating_sub(floor);
            let mut kept = Vec::with_capacity(pool.instances.len());
            for instance in pool.instances.drain(..) {
                let expired = !instance.busy
                    && now.saturating_duration_since(instance.last_used) >= idle_timeout;
                if expired && removable > 0 {
                    removable -= 1;
                    doomed.push((kind.clone(), instance));
                } else {
                    kept.push(instance);
                }
            }
            pool.instances = kept;
        }

        let retired = doomed.len();
        for (kind, instance) in doomed {
            self.destroy(&kind, instance.id, instance.worker).await;
        }
        if retired > 0 {
            info!(retired, "Swept idle worker instances");
        }
        retired
    }

    /// Run [`sweep_idle`](Self::sweep_idle) every `sweep_interval` until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let factory = self.clone();
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        factory.sweep_idle(Instant::now()).await;
                    }
                }
            }
            debug!("Pool sweeper stopped");
        })
    }

    /// Destroy every idle instance. Busy instances are destroyed on retire.
    pub async fn shutdown(&self) -> usize {
        let pools: Vec<(String, Arc<Mutex<KindPool>>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        let mut doomed = Vec::new();
        for (kind, pool) in pools {
            let mut pool = pool.lock();
            let (idle, busy): (Vec<_>, Vec<_>) =
                pool.instances.drain(..).partition(|i| !i.busy);
            pool.instances = busy;
            doomed.extend(idle.into_iter().map(|i| (kind.clone(), i)));
        }
        let count = doomed.len();
        for (kind, instance) in doomed {
            self.destroy(&kind, instance.id, instance.worker).await;
        }
        count
    }

    pub fn busy_count(&self, kind: &str) -> usize {
        self.pools
            .read()
            .get(kind)
            .map(|p| p.lock().busy())
            .unwrap_or(0)
    }

    pub fn instance_count(&self, kind: &str) -> usize {
        self.pools
            .read()
            .get(kind)
            .map(|p| p.lock().instances.len())
            .unwrap_or(0)
    }

    pub fn instances(&self, kind: &str) -> Vec<InstanceInfo> {
        let Some(pool) = self.pools.read().get(kind).cloned() else {
            return Vec::new();
        };
        let pool = pool.lock();
        pool.instances
            .iter()
            .map(|i| InstanceInfo {
                instance_id: i.id,
                kind: kind.to_string(),
                busy: i.busy,
                created_at: i.created_at,
                idle_for_ms: if i.busy {
                    0
                } else {
                    i.last_used.elapsed().as_millis() as u64
                },
                tasks_served: i.tasks_served,
            })
            .collect()
    }

    pub fn utilization_of(&self, kind: &str) -> Option<PoolUtilization> {
        let ceiling = self.ceiling(kind)?;
        let (busy, total) = self
            .pools
            .read()
            .get(kind)
            .map(|p| {
                let p = p.lock();
                (p.busy(), p.instances.len())
            })
            .unwrap_or((0, 0));
        Some(PoolUtilization {
            kind: kind.to_string(),
            busy,
            idle: total - busy,
            max_instances: ceiling,
            utilization: busy as f64 / ceiling.max(1) as f64,
        })
    }

    /// Utilization of every registered kind, sorted by kind name.
    pub fn utilization(&self) -> Vec<PoolUtilization> {
        self.registry
            .kinds()
            .iter()
            .filter_map(|k| self.utilization_of(k))
            .collect()
    }

    pub fn metrics(&self) -> FactoryMetrics {
        FactoryMetrics {
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            cache_hits: self.counters.hits.load(Ordering::Relaxed),
            cache_misses: self.counters.misses.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}

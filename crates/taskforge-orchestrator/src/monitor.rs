use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Execution counters for one worker kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindMetrics {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub duration_ms: u64,
}

impl KindMetrics {
    pub fn running(&self) -> u64 {
        self.started
            .saturating_sub(self.completed + self.failed + self.cancelled)
    }

    /// Failed share of finished executions. Timeouts count as failures.
    pub fn error_rate(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.failed as f64 / finished as f64
        }
    }

    pub fn avg_duration_ms(&self) -> f64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0.0
        } else {
            self.duration_ms as f64 / finished as f64
        }
    }

    /// Success weighted down by slowness; 0.5 until anything has finished.
    pub fn performance_score(&self) -> f64 {
        if self.completed + self.failed == 0 {
            return 0.5;
        }
        (1.0 - self.error_rate()) / (1.0 + self.avg_duration_ms() / 60_000.0)
    }
}

/// Per-kind snapshot for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindState {
    pub kind: String,
    pub running: u64,
    pub metrics: KindMetrics,
    pub performance_score: f64,
}

/// Tracks execution metrics for every worker kind.
#[derive(Debug, Default)]
pub struct WorkerMonitor {
    kinds: RwLock<HashMap<String, KindMetrics>>,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, kind: &str) {
        self.kinds.write().entry(kind.to_string()).or_default().started += 1;
    }

    pub fn record_completed(&self, kind: &str, duration_ms: u64) {
        let mut kinds = self.kinds.write();
        let m = kinds.entry(kind.to_string()).or_default();
        m.completed += 1;
        m.duration_ms += duration_ms;
    }

    pub fn record_failed(&self, kind: &str, duration_ms: u64, timed_out: bool) {
        let mut kinds = self.kinds.write();
        let m = kinds.entry(kind.to_string()).or_default();
        m.failed += 1;
        m.duration_ms += duration_ms;
        if timed_out {
            m.timed_out += 1;
        }
    }

    pub fn record_cancelled(&self, kind: &str) {
        self.kinds.write().entry(kind.to_string()).or_default().cancelled += 1;
    }

    pub fn metrics(&self, kind: &str) -> KindMetrics {
        self.kinds.read().get(kind).cloned().unwrap_or_default()
    }

    pub fn performance(&self, kind: &str) -> f64 {
        self.metrics(kind).performance_score()
    }

    pub fn error_rate(&self, kind: &str) -> f64 {
        self.metrics(kind).error_rate()
    }

    pub fn running(&self, kind: &str) -> u64 {
        self.metrics(kind).running()
    }

    /// Aggregate success ratio across every kind; 1.0 before any task finishes.
    pub fn health_score(&self) -> f64 {
        let total = self.aggregate();
        let finished = total.completed + total.failed;
        if finished == 0 {
            1.0
        } else {
            total.completed as f64 / finished as f64
        }
    }

    pub fn aggregate(&self) -> KindMetrics {
        let kinds = self.kinds.read();
        let mut total = KindMetrics::default();
        for m in kinds.values() {
            total.started += m.started;
            total.completed += m.completed;
            total.failed += m.failed;
            total.timed_out += m.timed_out;
            total.cancelled += m.cancelled;
            total.duration_ms += m.duration_ms;
        }
        total
    }

    /// Snapshot of every kind, sorted by name.
    pub fn snapshot(&self) -> Vec<KindState> {
        let kinds = self.kinds.read();
        let mut states: Vec<KindState> = kinds
            .iter()
            .map(|(kind, m)| KindState {
                kind: kind.clone(),
                running: m.running(),
                performance_score: m.performance_score(),
                metrics: m.clone(),
            })
            .collect();
        states.sort_by(|a, b| a.kind.cmp(&b.kind));
        states
    }

    /// Serialize the current state as JSON for dashboards.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kinds": self.snapshot(),
            "aggregate": self.aggregate(),
            "health_score": self.health_score(),
        })
    }
}

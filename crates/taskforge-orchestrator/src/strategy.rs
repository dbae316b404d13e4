//! Pluggable selection policies shared by the scheduler (choosing a worker
//! kind for capability-targeted tasks) and the workspace distributor
//! (choosing a workspace).
//!
//! Every policy is a pure function of the candidates and the task. A `None`
//! result means no candidate has room, and the caller decides whether to
//! scale up or defer.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use taskforge_core::{Priority, TaskforgeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Cycle through candidates in order.
    RoundRobin,
    /// Lowest current load first.
    LeastLoaded,
    /// Specialists for the task kind first, then generalists, by performance.
    #[default]
    CapabilityBased,
    /// Highest learned affinity for the task kind.
    AffinityBased,
    /// Urgent tasks take the best performer among equally loaded candidates.
    PriorityBased,
}

impl std::fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DistributionStrategy::RoundRobin => "round_robin",
            DistributionStrategy::LeastLoaded => "least_loaded",
            DistributionStrategy::CapabilityBased => "capability_based",
            DistributionStrategy::AffinityBased => "affinity_based",
            DistributionStrategy::PriorityBased => "priority_based",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DistributionStrategy {
    type Err = TaskforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(DistributionStrategy::RoundRobin),
            "least_loaded" => Ok(DistributionStrategy::LeastLoaded),
            "capability_based" | "capability" => Ok(DistributionStrategy::CapabilityBased),
            "affinity_based" | "affinity" => Ok(DistributionStrategy::AffinityBased),
            "priority_based" | "priority" => Ok(DistributionStrategy::PriorityBased),
            other => Err(TaskforgeError::Config(format!(
                "Unknown distribution strategy '{other}'"
            ))),
        }
    }
}

/// A worker kind or workspace being considered for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    /// Task kind this candidate is dedicated to; `None` for generalists.
    pub specialization: Option<String>,
    pub current_load: usize,
    pub max_load: usize,
    pub performance_score: f64,
    pub error_rate: f64,
    /// Learned preference per task kind.
    pub affinity: HashMap<String, f64>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, current_load: usize, max_load: usize) -> Self {
        Self {
            id: id.into(),
            specialization: None,
            current_load,
            max_load,
            performance_score: 0.5,
            error_rate: 0.0,
            affinity: HashMap::new(),
        }
    }

    pub fn specialized(mut self, kind: impl Into<String>) -> Self {
        self.specialization = Some(kind.into());
        self
    }

    pub fn with_performance(mut self, score: f64) -> Self {
        self.performance_score = score;
        self
    }

    pub fn with_affinity(mut self, kind: impl Into<String>, score: f64) -> Self {
        self.affinity.insert(kind.into(), score);
        self
    }

    pub fn has_room(&self) -> bool {
        self.current_load < self.max_load
    }

    pub fn affinity_for(&self, kind: &str) -> f64 {
        self.affinity.get(kind).copied().unwrap_or(0.0)
    }
}

/// What a strategy needs to know about the task being placed.
#[derive(Debug, Clone, Copy)]
pub struct TaskProfile<'a> {
    pub kind: &'a str,
    pub priority: Priority,
}

/// Pick a candidate index. `cursor` is only read by round-robin.
pub fn select(
    strategy: DistributionStrategy,
    candidates: &[Candidate],
    task: &TaskProfile<'_>,
    cursor: usize,
) -> Option<usize> {
    let eligible: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].has_room())
        .collect();
    if eligible.is_empty() {
        return None;
    }

    match strategy {
        DistributionStrategy::RoundRobin => {
            let n = candidates.len();
            (0..n)
                .map(|offset| (cursor + offset) % n)
                .find(|&i| candidates[i].has_room())
        }
        DistributionStrategy::LeastLoaded => eligible
            .into_iter()
            .min_by_key(|&i| candidates[i].current_load),
        DistributionStrategy::CapabilityBased => {
            let tier = |c: &Candidate| match c.specialization.as_deref() {
                Some(s) if s == task.kind => Some(0),
                None => Some(1),
                Some(_) => None,
            };
            eligible
                .into_iter()
                .filter_map(|i| tier(&candidates[i]).map(|t| (t, i)))
                .min_by(|(ta, a), (tb, b)| {
                    let (ca, cb) = (&candidates[*a], &candidates[*b]);
                    ta.cmp(tb)
                        .then_with(|| cb.performance_score.total_cmp(&ca.performance_score))
                        .then_with(|| ca.current_load.cmp(&cb.current_load))
                })
                .map(|(_, i)| i)
        }
        DistributionStrategy::AffinityBased => eligible.into_iter().min_by(|a, b| {
            let (ca, cb) = (&candidates[*a], &candidates[*b]);
            cb.affinity_for(task.kind)
                .total_cmp(&ca.affinity_for(task.kind))
                .then_with(|| ca.current_load.cmp(&cb.current_load))
        }),
        DistributionStrategy::PriorityBased => {
            let min_load = eligible
                .iter()
                .map(|&i| candidates[i].current_load)
                .min()?;
            let tied = eligible
                .into_iter()
                .filter(|&i| candidates[i].current_load == min_load);
            let by_perf = |a: &usize, b: &usize| {
                candidates[*a]
                    .performance_score
                    .total_cmp(&candidates[*b].performance_score)
            };
            if task.priority >= Priority::High {
                // max_by returns the last maximum; keep the first instead.
                tied.min_by(|a, b| by_perf(b, a))
            } else {
                tied.min_by(by_perf)
            }
        }
    }
}

/// A strategy plus the round-robin cursor it needs between calls.
#[derive(Debug)]
pub struct StrategyEngine {
    strategy: DistributionStrategy,
    cursor: AtomicUsize,
}

impl StrategyEngine {
    pub fn new(strategy: DistributionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    pub fn pick(&self, candidates: &[Candidate], task: &TaskProfile<'_>) -> Option<usize> {
        self.pick_with(self.strategy, candidates, task)
    }

    /// Pick with an explicit strategy, sharing this engine's cursor.
    pub fn pick_with(
        &self,
        strategy: DistributionStrategy,
        candidates: &[Candidate],
        task: &TaskProfile<'_>,
    ) -> Option<usize> {
        let cursor = self.cursor.load(AtomicOrdering::Relaxed);
        let picked = select(strategy, candidates, task, cursor)?;
        if strategy == DistributionStrategy::RoundRobin {
            self.cursor.store(picked + 1, AtomicOrdering::Relaxed);
        }
        Some(picked)
    }
}

//! Recovery strategies, per-target circuit breakers, and the retry loop that
//! snapshots state and rolls back when a recovery does not hold.

use super::types::FailureGroup;
use crate::config::SwarmConfig;
use crate::worker::Worker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    CircuitBreaker,
    GracefulDegradation,
    Rollback,
    Restart,
    Failover,
    AutoScale,
    CacheFallback,
}

impl std::fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RecoveryStrategy::RetryWithBackoff => "retry_with_backoff",
            RecoveryStrategy::CircuitBreaker => "circuit_breaker",
            RecoveryStrategy::GracefulDegradation => "graceful_degradation",
            RecoveryStrategy::Rollback => "rollback",
            RecoveryStrategy::Restart => "restart",
            RecoveryStrategy::Failover => "failover",
            RecoveryStrategy::AutoScale => "auto_scale",
            RecoveryStrategy::CacheFallback => "cache_fallback",
        };
        write!(f, "{s}")
    }
}

/// Built-in error-type fragments, checked in order.
const STRATEGY_MAP: &[(&[&str], RecoveryStrategy)] = &[
    (&["timeout", "timed_out", "transient"], RecoveryStrategy::RetryWithBackoff),
    (
        &["connection", "network", "unavailable", "refused"],
        RecoveryStrategy::CircuitBreaker,
    ),
    (
        &["memory", "oom", "resource", "overload", "capacity"],
        RecoveryStrategy::AutoScale,
    ),
    (
        &["deploy", "migration", "corrupt", "config"],
        RecoveryStrategy::Rollback,
    ),
    (
        &["crash", "panic", "deadlock", "hang"],
        RecoveryStrategy::Restart,
    ),
    (
        &["node", "host", "region", "database", "replica"],
        RecoveryStrategy::Failover,
    ),
    (&["cache", "stale"], RecoveryStrategy::CacheFallback),
    (
        &["dependency", "degraded", "external", "upstream"],
        RecoveryStrategy::GracefulDegradation,
    ),
];

/// Pick a strategy for an error type. Overrides are matched first, by substring.
pub fn select_strategy(
    error_type: &str,
    overrides: &BTreeMap<String, RecoveryStrategy>,
) -> RecoveryStrategy {
    let error_type = error_type.to_lowercase();
    if let Some(strategy) = overrides
        .iter()
        .find(|(fragment, _)| error_type.contains(fragment.to_lowercase().as_str()))
        .map(|(_, s)| *s)
    {
        return strategy;
    }
    STRATEGY_MAP
        .iter()
        .find(|(fragments, _)| fragments.iter().any(|f| error_type.contains(f)))
        .map(|(_, s)| *s)
        .unwrap_or(RecoveryStrategy::RetryWithBackoff)
}

/// One recovery attempt against a target component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub id: Uuid,
    pub group_id: String,
    pub target: String,
    pub strategy: RecoveryStrategy,
    /// 1-based.
    pub attempt: u32,
}

impl RecoveryAction {
    pub fn new(
        group_id: impl Into<String>,
        target: impl Into<String>,
        strategy: RecoveryStrategy,
        attempt: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id: group_id.into(),
            target: target.into(),
            strategy,
            attempt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Closed until `threshold` consecutive failures, then open for `cooldown`,
/// then half-open for exactly one trial.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    cooldown: Duration,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            cooldown,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether an attempt may run at `now`. An open breaker whose cooldown has
    /// elapsed turns half-open and grants a single trial.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight {
                    false
                } else {
                    self.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Closed if self.consecutive_failures >= self.threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }
    }
}

/// Breakers keyed by recovery target, created on first use.
pub struct CircuitBreakerRegistry {
    threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, target: &str, now: Instant) -> bool {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown));
        let before = breaker.state();
        let allowed = breaker.try_acquire(now);
        if before != breaker.state() {
            info!(target_component = %target, "Circuit half-open, allowing one trial");
        }
        allowed
    }

    pub fn record_success(&self, target: &str) {
        if let Some(breaker) = self.breakers.lock().get_mut(target) {
            if breaker.state() != CircuitState::Closed {
                info!(target_component = %target, "Circuit closed");
            }
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, target: &str, now: Instant) {
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(target.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.threshold, self.cooldown));
        let before = breaker.state();
        breaker.record_failure(now);
        if before != CircuitState::Open && breaker.state() == CircuitState::Open {
            warn!(
                target_component = %target,
                failures = breaker.consecutive_failures(),
                "Circuit opened"
            );
        }
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.breakers
            .lock()
            .get(target)
            .map(CircuitBreaker::state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, target: &str) {
        self.breakers.lock().remove(target);
    }
}

/// Exponential backoff between recovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: config.retry_multiplier,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Attempts granted to a strategy; only retry-with-backoff repeats.
    pub fn attempts_for(&self, strategy: RecoveryStrategy) -> u32 {
        match strategy {
            RecoveryStrategy::RetryWithBackoff => self.max_attempts,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Succeeded,
    Failed,
    /// The target's circuit was open; the action was never invoked.
    RejectedCircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub group_id: String,
    pub target: String,
    pub kind: String,
    pub strategy: RecoveryStrategy,
    pub status: RecoveryStatus,
    pub attempts: u32,
    pub rolled_back: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl RecoveryOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RecoveryStatus::Succeeded
    }
}

/// Runs recovery actions through the breaker registry and retry policy.
pub struct RecoveryManager {
    policy: RetryPolicy,
    breakers: CircuitBreakerRegistry,
    auto_rollback: bool,
    overrides: BTreeMap<String, RecoveryStrategy>,
}

impl RecoveryManager {
    pub fn new(config: &SwarmConfig) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            breakers: CircuitBreakerRegistry::new(
                config.circuit_breaker_threshold,
                config.breaker_cooldown(),
            ),
            auto_rollback: config.auto_rollback,
            overrides: config.strategy_overrides.clone(),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn strategy_for(&self, group: &FailureGroup) -> RecoveryStrategy {
        select_strategy(&group.error_type, &self.overrides)
    }

    /// Recover the group's primary component with `worker`.
    ///
    /// Each attempt must pass the target's breaker, then `recover` and
    /// `verify_recovery`. When every attempt fails and auto-rollback is on,
    /// the snapshot taken before the first attempt is restored.
    pub async fn execute(
        &self,
        worker: &dyn Worker,
        kind: &str,
        group: &FailureGroup,
    ) -> RecoveryOutcome {
        let target = group.primary_component();
        let strategy = self.strategy_for(group);
        let mut outcome = RecoveryOutcome {
            group_id: group.id.clone(),
            target: target.clone(),
            kind: kind.to_string(),
            strategy,
            status: RecoveryStatus::Failed,
            attempts: 0,
            rolled_back: false,
            error: None,
        };

        let snapshot = if self.auto_rollback {
            match worker.snapshot(&target).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(target_component = %target, error = %e, "Snapshot before recovery failed");
                    None
                }
            }
        } else {
            None
        };

        let max_attempts = self.policy.attempts_for(strategy);
        for attempt in 1..=max_attempts {
            if !self.breakers.try_acquire(&target, Instant::now()) {
                warn!(target_component = %target, %strategy, "Recovery rejected, circuit open");
                if outcome.attempts == 0 {
                    outcome.status = RecoveryStatus::RejectedCircuitOpen;
                    outcome.error = Some(format!("circuit open for {target}"));
                    return outcome;
                }
                break;
            }

            outcome.attempts = attempt;
            let action = RecoveryAction::new(&group.id, &target, strategy, attempt);
            debug!(target_component = %target, %strategy, attempt, "Recovery attempt");
            let result = match worker.recover(&action).await {
                Ok(()) => {
                    if worker.verify_recovery(&action).await {
                        Ok(())
                    } else {
                        Err("recovery did not pass verification".to_string())
                    }
                }
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(()) => {
                    self.breakers.record_success(&target);
                    info!(target_component = %target, %strategy, attempt, "Recovery succeeded");
                    outcome.status = RecoveryStatus::Succeeded;
                    outcome.error = None;
                    return outcome;
                }
                Err(reason) => {
                    self.breakers.record_failure(&target, Instant::now());
                    warn!(target_component = %target, %strategy, attempt, error = %reason, "Recovery attempt failed");
                    outcome.error = Some(reason);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        if let Some(snapshot) = snapshot {
            match worker.restore(&target, &snapshot).await {
                Ok(()) => {
                    info!(target_component = %target, "Rolled back to pre-recovery snapshot");
                    outcome.rolled_back = true;
                }
                Err(e) => warn!(target_component = %target, error = %e, "Rollback failed"),
            }
        }
        outcome
    }
}

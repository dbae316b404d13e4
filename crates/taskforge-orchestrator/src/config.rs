use crate::strategy::DistributionStrategy;
use crate::swarm::RecoveryStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taskforge_core::{TaskforgeError, TaskforgeResult};

/// Top-level engine configuration, usually read from `taskforge.toml`.
///
/// Every field carries a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskforgeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub swarm: SwarmConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

impl TaskforgeConfig {
    pub fn from_toml_str(raw: &str) -> TaskforgeResult<Self> {
        let config: TaskforgeConfig = toml::from_str(raw)
            .map_err(|e| TaskforgeError::Config(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> TaskforgeResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TaskforgeError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> TaskforgeResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TaskforgeError::Config(format!("Cannot render configuration: {e}")))
    }

    pub fn validate(&self) -> TaskforgeResult<()> {
        let s = &self.scheduler;
        non_zero("scheduler.queue_capacity", s.queue_capacity)?;
        non_zero("scheduler.history_limit", s.history_limit)?;
        non_zero("scheduler.tick_interval_ms", s.tick_interval_ms as usize)?;
        if s.backoff_base_ms > s.backoff_max_ms {
            return Err(TaskforgeError::Config(
                "scheduler.backoff_base_ms must not exceed scheduler.backoff_max_ms".into(),
            ));
        }

        non_zero("pool.sweep_interval_secs", self.pool.sweep_interval_secs as usize)?;

        let d = &self.distributor;
        non_zero("distributor.max_workspaces", d.max_workspaces)?;
        non_zero("distributor.workspace_max_load", d.workspace_max_load)?;
        non_zero("distributor.queue_capacity", d.queue_capacity)?;
        non_zero("distributor.history_limit", d.history_limit)?;
        if d.branch_prefix.trim().is_empty() {
            return Err(TaskforgeError::Config(
                "distributor.branch_prefix must not be empty".into(),
            ));
        }

        let w = &self.swarm;
        unit_interval("swarm.consensus_threshold", w.consensus_threshold)?;
        unit_interval("swarm.low_health_threshold", w.low_health_threshold)?;
        non_zero(
            "swarm.circuit_breaker_threshold",
            w.circuit_breaker_threshold as usize,
        )?;
        non_zero("swarm.max_retry_attempts", w.max_retry_attempts as usize)?;
        non_zero("swarm.min_cluster_size", w.min_cluster_size)?;
        non_zero("swarm.heal_batch_size", w.heal_batch_size)?;
        non_zero("swarm.workflow_timeout_secs", w.workflow_timeout_secs as usize)?;
        if w.retry_multiplier < 1.0 {
            return Err(TaskforgeError::Config(
                "swarm.retry_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

fn non_zero(field: &str, value: usize) -> TaskforgeResult<()> {
    if value == 0 {
        return Err(TaskforgeError::Config(format!("{field} must be greater than 0")));
    }
    Ok(())
}

fn unit_interval(field: &str, value: f64) -> TaskforgeResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(TaskforgeError::Config(format!(
            "{field} must be within 0.0..=1.0, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of non-terminal tasks before submissions are rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Terminal tasks kept in memory; oldest are evicted first.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_dispatch_retries")]
    pub dispatch_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub default_task_timeout_secs: u64,
    /// Dispatch loop wake-up interval when idle.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Strategy used to pick a kind for capability-targeted tasks.
    #[serde(default = "default_capability_strategy")]
    pub capability_strategy: DistributionStrategy,
}

impl SchedulerConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            history_limit: default_history_limit(),
            dispatch_retries: default_dispatch_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            default_task_timeout_secs: default_task_timeout_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            capability_strategy: default_capability_strategy(),
        }
    }
}

fn default_queue_capacity() -> usize {
    10_000
}
fn default_history_limit() -> usize {
    1_000
}
fn default_dispatch_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    50
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_tick_interval_ms() -> u64 {
    100
}
fn default_capability_strategy() -> DistributionStrategy {
    DistributionStrategy::LeastLoaded
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Create instances on demand up to `max_instances`; when off a kind is
    /// held at `max(min_instances, 1)`.
    #[serde(default = "default_true")]
    pub auto_scale: bool,
    /// Pre-create `min_instances` per kind on start.
    #[serde(default = "default_true")]
    pub warm_up: bool,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            auto_scale: true,
            warm_up: true,
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default)]
    pub strategy: DistributionStrategy,
    #[serde(default = "default_true")]
    pub auto_provision: bool,
    #[serde(default = "default_max_workspaces")]
    pub max_workspaces: usize,
    #[serde(default = "default_workspace_max_load")]
    pub workspace_max_load: usize,
    #[serde(default = "default_workspace_idle_secs")]
    pub idle_timeout_secs: u64,
    /// Workspace tasks that may wait, parked or queued, for a free workspace.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Finished workspace tasks kept for status queries.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_distributor_tick_ms")]
    pub tick_interval_ms: u64,
    /// Repository to add worktrees to; unset means in-memory workspaces.
    #[serde(default)]
    pub repository: Option<PathBuf>,
    /// Directory for worktrees; defaults to `<repository>/.worktrees`.
    #[serde(default)]
    pub worktree_dir: Option<PathBuf>,
}

impl DistributorConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            strategy: DistributionStrategy::default(),
            auto_provision: true,
            max_workspaces: default_max_workspaces(),
            workspace_max_load: default_workspace_max_load(),
            idle_timeout_secs: default_workspace_idle_secs(),
            queue_capacity: default_queue_capacity(),
            history_limit: default_history_limit(),
            branch_prefix: default_branch_prefix(),
            tick_interval_ms: default_distributor_tick_ms(),
            repository: None,
            worktree_dir: None,
        }
    }
}

fn default_max_workspaces() -> usize {
    16
}
fn default_workspace_max_load() -> usize {
    4
}
fn default_workspace_idle_secs() -> u64 {
    600
}
fn default_branch_prefix() -> String {
    "taskforge".into()
}
fn default_distributor_tick_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Consecutive failures that open a target's circuit.
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    /// Group size that triggers a high-frequency recommendation.
    #[serde(default = "default_high_frequency_threshold")]
    pub high_frequency_threshold: usize,
    #[serde(default = "default_low_health_threshold")]
    pub low_health_threshold: f64,
    #[serde(default)]
    pub keep_completed_checkpoints: bool,
    /// Where checkpoints are written; unset keeps them in memory.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    #[serde(default = "default_heal_batch_size")]
    pub heal_batch_size: usize,
    #[serde(default = "default_heal_window_ms")]
    pub heal_window_ms: u64,
    /// Error-type substring to recovery strategy, checked before the built-in mapping.
    #[serde(default)]
    pub strategy_overrides: BTreeMap<String, RecoveryStrategy>,
}

impl SwarmConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_secs)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown_secs)
    }

    pub fn heal_window(&self) -> Duration {
        Duration::from_millis(self.heal_window_ms)
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            consensus_threshold: default_consensus_threshold(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_breaker_cooldown_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_ms(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_ms(),
            auto_rollback: true,
            workflow_timeout_secs: default_workflow_timeout_secs(),
            min_cluster_size: default_min_cluster_size(),
            high_frequency_threshold: default_high_frequency_threshold(),
            low_health_threshold: default_low_health_threshold(),
            keep_completed_checkpoints: false,
            checkpoint_dir: None,
            heal_batch_size: default_heal_batch_size(),
            heal_window_ms: default_heal_window_ms(),
            strategy_overrides: BTreeMap::new(),
        }
    }
}

fn default_consensus_threshold() -> f64 {
    0.7
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    60
}
fn default_max_retry_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    200
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_max_ms() -> u64 {
    10_000
}
fn default_workflow_timeout_secs() -> u64 {
    600
}
fn default_min_cluster_size() -> usize {
    2
}
fn default_high_frequency_threshold() -> usize {
    5
}
fn default_low_health_threshold() -> f64 {
    0.6
}
fn default_heal_batch_size() -> usize {
    10
}
fn default_heal_window_ms() -> u64 {
    2_000
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// JSONL file receiving task records and workflow reports.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TaskforgeConfig::default();
        assert_eq!(config.scheduler.queue_capacity, 10_000);
        assert_eq!(config.scheduler.history_limit, 1_000);
        assert_eq!(config.scheduler.dispatch_retries, 5);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(300));
        assert!(config.pool.auto_scale);
        assert_eq!(
            config.distributor.strategy,
            DistributionStrategy::CapabilityBased
        );
        assert_eq!(config.distributor.max_workspaces, 16);
        assert_eq!(config.swarm.consensus_threshold, 0.7);
        assert_eq!(config.swarm.circuit_breaker_threshold, 5);
        assert_eq!(config.swarm.breaker_cooldown(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_is_valid() {
        let config = TaskforgeConfig::from_toml_str("").unwrap();
        assert_eq!(config, TaskforgeConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let raw = r#"
[scheduler]
queue_capacity = 8

[swarm]
consensus_threshold = 0.5

[swarm.strategy_overrides]
deadlock = "restart"

[distributor]
strategy = "round_robin"
"#;
        let config = TaskforgeConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.scheduler.queue_capacity, 8);
        assert_eq!(config.scheduler.history_limit, 1_000);
        assert_eq!(config.swarm.consensus_threshold, 0.5);
        assert_eq!(
            config.swarm.strategy_overrides.get("deadlock"),
            Some(&RecoveryStrategy::Restart)
        );
        assert_eq!(config.distributor.strategy, DistributionStrategy::RoundRobin);
    }

    #[test]
    fn test_threshold_out_of_range() {
        let err = TaskforgeConfig::from_toml_str("[swarm]\nconsensus_threshold = 1.5\n").unwrap_err();
        assert!(matches!(err, TaskforgeError::Config(_)));
        assert!(err.to_string().contains("consensus_threshold"));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TaskforgeConfig::from_toml_str("[scheduler]\nqueue_capacity = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskforge.toml");
        std::fs::write(&path, "[pool]\nauto_scale = false\n").unwrap();
        let config = TaskforgeConfig::load(&path).unwrap();
        assert!(!config.pool.auto_scale);

        let missing = TaskforgeConfig::load(dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(TaskforgeError::Config(_))));
    }

    #[test]
    fn test_render_round_trip() {
        let config = TaskforgeConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[swarm]"));
        assert_eq!(TaskforgeConfig::from_toml_str(&rendered).unwrap(), config);
    }
}

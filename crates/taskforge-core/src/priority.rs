use crate::TaskforgeError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

/// Scheduling priority of a task.
///
/// Ordered `Critical > High > Medium > Low > Deferred`. Within a tier tasks are
/// dispatched in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Dispatched before anything else.
    Critical,
    /// Above normal work.
    High,
    /// Normal work.
    Medium,
    /// Background work.
    Low,
    /// Runs only when nothing else is waiting.
    Deferred,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    /// All tiers from highest to lowest.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
        Priority::Deferred,
    ];

    /// Numeric weight, higher is more urgent.
    pub fn weight(self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
            Priority::Deferred => 0,
        }
    }

    /// Ordinal used in flat records (`Critical = 0` .. `Deferred = 4`).
    pub fn ordinal(self) -> u8 {
        4 - self.weight()
    }

    /// Inverse of [`Priority::ordinal`].
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight().cmp(&other.weight())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
            Priority::Deferred => write!(f, "deferred"),
        }
    }
}

impl FromStr for Priority {
    type Err = TaskforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" | "normal" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "deferred" => Ok(Priority::Deferred),
            other => Err(TaskforgeError::Config(format!("unknown priority '{other}'"))),
        }
    }
}

/// Declared priority of a reported failure handled by the swarm workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePriority {
    /// Service-threatening; recovery runs first.
    Emergency,
    /// Recovery runs first.
    Critical,
    /// Routed through debugging before correction.
    High,
    /// Routed to direct correction.
    Medium,
    /// Routed to direct correction.
    Low,
}

impl FailurePriority {
    /// Numeric weight, higher is more urgent.
    pub fn weight(self) -> u8 {
        match self {
            FailurePriority::Emergency => 5,
            FailurePriority::Critical => 4,
            FailurePriority::High => 3,
            FailurePriority::Medium => 2,
            FailurePriority::Low => 1,
        }
    }

    /// Emergency and critical failures go to recovery before anything else.
    pub fn requires_recovery(self) -> bool {
        matches!(self, FailurePriority::Emergency | FailurePriority::Critical)
    }
}

impl Default for FailurePriority {
    fn default() -> Self {
        FailurePriority::Medium
    }
}

impl Ord for FailurePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.weight().cmp(&other.weight())
    }
}

impl PartialOrd for FailurePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for FailurePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePriority::Emergency => write!(f, "emergency"),
            FailurePriority::Critical => write!(f, "critical"),
            FailurePriority::High => write!(f, "high"),
            FailurePriority::Medium => write!(f, "medium"),
            FailurePriority::Low => write!(f, "low"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Low > Priority::Deferred);
        let mut tiers = vec![Priority::Low, Priority::Critical, Priority::Deferred];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![Priority::Deferred, Priority::Low, Priority::Critical]
        );
    }

    #[test]
    fn test_ordinal_roundtrip() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_ordinal(p.ordinal()), Some(p));
        }
        assert_eq!(Priority::Critical.ordinal(), 0);
        assert_eq!(Priority::from_ordinal(9), None);
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_failure_priority_routing() {
        assert!(FailurePriority::Emergency.requires_recovery());
        assert!(FailurePriority::Critical.requires_recovery());
        assert!(!FailurePriority::High.requires_recovery());
        assert!(FailurePriority::Emergency > FailurePriority::Critical);
    }
}

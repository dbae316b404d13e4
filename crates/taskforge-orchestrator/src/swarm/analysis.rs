//! Analyze phase: recurring clusters, trends and short-horizon predictions.

use super::types::{Failure, FailureGroup};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Increasing => write!(f, "increasing"),
            Trend::Decreasing => write!(f, "decreasing"),
            Trend::Stable => write!(f, "stable"),
        }
    }
}

/// A failure pattern that recurs at least `min_cluster_size` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub group_id: String,
    pub error_type: String,
    pub signature: String,
    pub size: usize,
    pub components: Vec<String>,
    pub trend: Trend,
    /// Occurrences in the earlier and later half of the batch window.
    pub first_half: usize,
    pub second_half: usize,
    /// Expected occurrences in the next window of the same length.
    pub predicted_next: f64,
}

/// Findings attached to the workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_failures: usize,
    pub distinct_patterns: usize,
    pub clusters: Vec<Cluster>,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

impl AnalysisSummary {
    pub fn cluster(&self, group_id: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.group_id == group_id)
    }

    pub fn increasing(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters
            .iter()
            .filter(|c| c.trend == Trend::Increasing)
    }
}

/// Classify a `before -> after` change. Moves smaller than a quarter of the
/// cluster (and never less than one occurrence) count as stable.
pub fn classify_trend(first_half: usize, second_half: usize) -> Trend {
    let size = first_half + second_half;
    let threshold = (size as f64 * 0.25).max(1.0);
    let delta = second_half as f64 - first_half as f64;
    if delta > threshold {
        Trend::Increasing
    } else if -delta > threshold {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Linear extrapolation of the half-window counts, floored at zero.
pub fn predict_next(first_half: usize, second_half: usize) -> f64 {
    let (a, b) = (first_half as f64, second_half as f64);
    (b + (b - a)).max(0.0)
}

pub fn analyze(groups: &[FailureGroup], failures: &[Failure], min_cluster_size: usize) -> AnalysisSummary {
    let occurred: HashMap<Uuid, DateTime<Utc>> =
        failures.iter().map(|f| (f.id, f.occurred_at)).collect();
    let window_start = failures.iter().map(|f| f.occurred_at).min();
    let window_end = failures.iter().map(|f| f.occurred_at).max();

    let clusters = groups
        .iter()
        .filter(|g| g.size() >= min_cluster_size.max(1))
        .map(|group| {
            let (first_half, second_half) = match (window_start, window_end) {
                (Some(start), Some(end)) if end > start => {
                    let midpoint = start + (end - start) / 2;
                    let early = group
                        .failure_ids
                        .iter()
                        .filter_map(|id| occurred.get(id))
                        .filter(|at| **at < midpoint)
                        .count();
                    (early, group.size() - early)
                }
                // A zero-length window carries no direction.
                _ => (group.size(), group.size()),
            };
            let trend = if first_half == second_half && first_half == group.size() {
                Trend::Stable
            } else {
                classify_trend(first_half, second_half)
            };
            Cluster {
                group_id: group.id.clone(),
                error_type: group.error_type.clone(),
                signature: group.signature.clone(),
                size: group.size(),
                components: group.components.iter().cloned().collect(),
                trend,
                first_half,
                second_half,
                predicted_next: predict_next(first_half, second_half),
            }
        })
        .collect();

    AnalysisSummary {
        total_failures: failures.len(),
        distinct_patterns: groups.len(),
        clusters,
        window_start,
        window_end,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::swarm::collect::collect;
    use chrono::Duration;
    use taskforge_core::FailurePriority;

    fn failure(error_type: &str, minutes: i64) -> Failure {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Failure::new(error_type, "boom", "svc", FailurePriority::Medium)
            .at(base + Duration::minutes(minutes))
    }

    #[test]
    fn test_trend_thresholds() {
        assert_eq!(classify_trend(1, 5), Trend::Increasing);
        assert_eq!(classify_trend(5, 1), Trend::Decreasing);
        assert_eq!(classify_trend(3, 4), Trend::Stable);
        assert_eq!(classify_trend(0, 1), Trend::Stable);
        assert_eq!(predict_next(1, 5), 9.0);
        assert_eq!(predict_next(5, 1), 0.0);
    }

    #[test]
    fn test_only_recurring_groups_cluster() {
        let mut batch: Vec<Failure> = (0..6).map(|m| failure("timeout", m)).collect();
        batch.push(failure("panic", 3));
        let groups = collect(&batch);
        let summary = analyze(&groups, &batch, 2);
        assert_eq!(summary.distinct_patterns, 2);
        assert_eq!(summary.clusters.len(), 1);
        assert_eq!(summary.clusters[0].size, 6);
        assert_eq!(summary.clusters[0].error_type, "timeout");
    }

    #[test]
    fn test_increasing_burst() {
        let mut batch = vec![failure("oom", 0)];
        batch.extend((0..5).map(|i| failure("oom", 50 + i)));
        batch.push(failure("disk", 60));
        let groups = collect(&batch);
        let summary = analyze(&groups, &batch, 2);
        let cluster = &summary.clusters[0];
        assert_eq!((cluster.first_half, cluster.second_half), (1, 5));
        assert_eq!(cluster.trend, Trend::Increasing);
        assert_eq!(summary.increasing().count(), 1);
    }

    #[test]
    fn test_same_instant_is_stable() {
        let batch: Vec<Failure> = (0..3).map(|_| failure("io", 0)).collect();
        let groups = collect(&batch);
        let summary = analyze(&groups, &batch, 2);
        assert_eq!(summary.clusters[0].trend, Trend::Stable);
        assert_eq!(summary.clusters[0].predicted_next, 3.0);
    }
}

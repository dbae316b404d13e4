//! Collect phase: fold a failure batch into fingerprinted groups ranked by severity.

use super::types::{Failure, FailureGroup};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

/// Volatile fragments replaced before fingerprinting, applied in order.
static NORMALIZERS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            "<id>",
        ),
        (r#""[^"]*"|'[^']*'"#, "<str>"),
        (r"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+){2,}", "<path>"),
        (r"\b0x[0-9a-fA-F]+\b|\b[0-9a-fA-F]{12,}\b", "<hex>"),
        (r"\d+(?:\.\d+)?", "<n>"),
        (r"\s+", " "),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Strip ids, literals, paths and numbers so that repeats of one failure
/// share a signature.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.to_string();
    for (re, replacement) in NORMALIZERS.iter() {
        normalized = re.replace_all(&normalized, *replacement).into_owned();
    }
    normalized.trim().to_string()
}

/// First 16 hex chars of `sha256(error_type \0 signature)`.
pub fn fingerprint(error_type: &str, signature: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(signature.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Group duplicates and rank the groups, most severe first.
///
/// Severity is out of 100: 50 from the highest declared priority, 30 from the
/// group's share of the batch, 20 from the share of affected components.
pub fn collect(failures: &[Failure]) -> Vec<FailureGroup> {
    let mut groups: HashMap<String, FailureGroup> = HashMap::new();
    for failure in failures {
        let signature = normalize_message(&failure.message);
        let id = fingerprint(&failure.error_type, &signature);
        let group = groups.entry(id.clone()).or_insert_with(|| FailureGroup {
            id,
            error_type: failure.error_type.clone(),
            signature,
            sample_message: failure.message.clone(),
            failure_ids: Vec::new(),
            components: BTreeSet::new(),
            priority: failure.priority,
            severity: 0.0,
            first_seen: failure.occurred_at,
            last_seen: failure.occurred_at,
        });
        group.failure_ids.push(failure.id);
        if !failure.component.is_empty() {
            group.components.insert(failure.component.clone());
        }
        group.priority = group.priority.max(failure.priority);
        group.first_seen = group.first_seen.min(failure.occurred_at);
        group.last_seen = group.last_seen.max(failure.occurred_at);
    }

    let total = failures.len().max(1) as f64;
    let all_components = failures
        .iter()
        .filter(|f| !f.component.is_empty())
        .map(|f| f.component.as_str())
        .collect::<BTreeSet<_>>()
        .len()
        .max(1) as f64;

    let mut ranked: Vec<FailureGroup> = groups
        .into_values()
        .map(|mut group| {
            group.severity = 50.0 * f64::from(group.priority.weight()) / 5.0
                + 30.0 * group.size() as f64 / total
                + 20.0 * group.components.len() as f64 / all_components;
            group
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.severity
            .total_cmp(&a.severity)
            .then_with(|| a.first_seen.cmp(&b.first_seen))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use taskforge_core::FailurePriority;

    #[test]
    fn test_normalize_strips_volatile_parts() {
        let a = normalize_message("timeout after 3000ms on /var/lib/db/data.sock for 'orders'");
        let b = normalize_message("timeout after 12ms on /tmp/x/y.sock for 'users'");
        assert_eq!(a, b);
        assert!(a.contains("<path>"));
        assert!(a.contains("<str>"));

        let id = normalize_message("job 4f1c2b9e-0000-4000-8000-123456789abc failed at 0xdeadbeef");
        assert_eq!(id, "job <id> failed at <hex>");
    }

    #[test]
    fn test_fingerprint_depends_on_type() {
        assert_eq!(fingerprint("io", "x").len(), 16);
        assert_eq!(fingerprint("io", "x"), fingerprint("io", "x"));
        assert_ne!(fingerprint("io", "x"), fingerprint("net", "x"));
    }

    #[test]
    fn test_groups_and_severity_order() {
        let mut batch = Vec::new();
        for n in 0..4 {
            batch.push(Failure::new(
                "connection_error",
                format!("connection refused on port {n}"),
                format!("svc-{n}"),
                FailurePriority::Low,
            ));
        }
        batch.push(Failure::new(
            "panic",
            "index out of bounds",
            "parser",
            FailurePriority::Emergency,
        ));

        let groups = collect(&batch);
        assert_eq!(groups.len(), 2);
        // 50 + 6 + 4 for the lone emergency vs 10 + 24 + 16 for the repeats.
        assert_eq!(groups[0].error_type, "panic");
        assert!((groups[0].severity - 60.0).abs() < 1e-9);
        assert_eq!(groups[1].size(), 4);
        assert_eq!(groups[1].components.len(), 4);
        assert!((groups[1].severity - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_takes_highest_priority() {
        let batch = vec![
            Failure::new("oom", "heap exhausted", "api", FailurePriority::Low),
            Failure::new("oom", "heap exhausted", "api", FailurePriority::Critical),
        ];
        let groups = collect(&batch);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].priority, FailurePriority::Critical);
        assert_eq!(groups[0].components.len(), 1);
    }
}

use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use taskforge_orchestrator::{
    Capability, Diagnosis, FailureGroup, Fix, Task, TestVerdict, Worker, WorkerCategory,
    WorkerDescriptor,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Confidence when no rule matches; below the default consensus threshold.
const BASELINE_CONFIDENCE: f64 = 0.3;

struct Rule {
    name: &'static str,
    pattern: Regex,
    confidence: f64,
    root_cause: &'static str,
    remedy: &'static str,
}

fn rule(
    name: &'static str,
    pattern: &str,
    confidence: f64,
    root_cause: &'static str,
    remedy: &'static str,
) -> Option<Rule> {
    Regex::new(pattern).ok().map(|pattern| Rule {
        name,
        pattern,
        confidence,
        root_cause,
        remedy,
    })
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    [
        rule(
            "timeout",
            r"\b(timed? ?out|timeout|deadline exceeded)\b",
            0.85,
            "Upstream call exceeded its deadline",
            "Raise the client timeout and retry with exponential backoff",
        ),
        rule(
            "connection",
            r"\b(connection (refused|reset)|econnrefused|unreachable|broken pipe)\b",
            0.8,
            "Dependency endpoint is unreachable",
            "Verify service discovery and guard the client with a circuit breaker",
        ),
        rule(
            "disk",
            r"\b(disk full|no space left|enospc)\b",
            0.8,
            "Volume ran out of space",
            "Rotate logs and expand the volume",
        ),
        rule(
            "memory",
            r"\b(out of memory|oom|allocation failed)\b",
            0.8,
            "Process exhausted its memory limit",
            "Raise the memory limit and bound the offending buffers",
        ),
        rule(
            "parse",
            r"\b(parse|syntax|unexpected (token|end)|invalid json|deserializ\w*)\b",
            0.75,
            "Malformed input reached the parser",
            "Validate input at the boundary and reject malformed payloads",
        ),
        rule(
            "null",
            r"\b(null|nil|none|undefined)\b.*\b(reference|pointer|value)\b",
            0.75,
            "Missing value dereferenced",
            "Guard the optional value and return an explicit error",
        ),
        rule(
            "permission",
            r"\b(permission denied|forbidden|unauthori[sz]ed|access denied)\b",
            0.7,
            "Credentials lack the required permission",
            "Grant the missing permission or refresh the credentials",
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

fn matching_rule(group: &FailureGroup) -> Option<&'static Rule> {
    let text = format!(
        "{} {} {}",
        group.error_type, group.signature, group.sample_message
    )
    .to_lowercase();
    RULES.iter().find(|r| r.pattern.is_match(&text))
}

/// Keyword-driven triage for swarm runs: votes on, diagnoses and proposes
/// remedies for well-known failure patterns.
#[derive(Default)]
pub struct TriageWorker;

impl TriageWorker {
    pub fn new() -> Self {
        Self
    }

    pub fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::new("triage", WorkerCategory::Debugging)
            .with_description("Keyword-based diagnosis of common failure patterns")
            .with_capabilities([
                Capability::PatternAnalysis,
                Capability::Debugging,
                Capability::Correction,
            ])
            .with_instances(0, 2)
    }
}

#[async_trait]
impl Worker for TriageWorker {
    /// As a task, triage classifies the `message` in the payload.
    async fn execute(
        &self,
        task: &Task,
        _cancel: CancellationToken,
    ) -> TaskforgeResult<serde_json::Value> {
        let message = task
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskforgeError::Execution("payload needs a 'message' string".into()))?
            .to_lowercase();
        let found = RULES.iter().find(|r| r.pattern.is_match(&message));
        Ok(match found {
            Some(r) => serde_json::json!({
                "rule": r.name,
                "root_cause": r.root_cause,
                "remedy": r.remedy,
            }),
            None => serde_json::json!({ "rule": null }),
        })
    }

    async fn confidence(&self, group: &FailureGroup) -> f64 {
        match matching_rule(group) {
            // Repetition makes the pattern more believable.
            Some(r) if group.size() >= 3 => (r.confidence + 0.05).min(0.95),
            Some(r) => r.confidence,
            None => BASELINE_CONFIDENCE,
        }
    }

    async fn diagnose(&self, group: &FailureGroup) -> TaskforgeResult<Option<Diagnosis>> {
        let Some(r) = matching_rule(group) else {
            debug!(group = %group.id, "No triage rule matched");
            return Ok(None);
        };
        Ok(Some(Diagnosis {
            group_id: group.id.clone(),
            kind: "triage".into(),
            root_cause: r.root_cause.to_string(),
            confidence: r.confidence,
            details: serde_json::json!({
                "rule": r.name,
                "components": group.components,
                "occurrences": group.size(),
            }),
        }))
    }

    async fn propose_fix(
        &self,
        group: &FailureGroup,
        diagnosis: Option<&Diagnosis>,
    ) -> TaskforgeResult<Option<Fix>> {
        let Some(r) = matching_rule(group) else {
            return Ok(None);
        };
        let mut changes = vec![r.remedy.to_string()];
        if let Some(d) = diagnosis {
            changes.push(format!("Root cause: {}", d.root_cause));
        }
        Ok(Some(Fix::new(
            &group.id,
            "triage",
            format!("{} in {}", r.remedy, group.primary_component()),
            changes,
        )))
    }

    /// Triage has no test harness of its own.
    async fn run_tests(&self, _fix: &Fix) -> TaskforgeResult<TestVerdict> {
        Ok(TestVerdict::Skipped)
    }
}

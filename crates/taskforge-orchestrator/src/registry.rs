use crate::worker::WorkerBuilder;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use taskforge_core::{TaskforgeError, TaskforgeResult};
use tracing::info;

/// Capability tags a worker kind can declare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    ErrorAggregation,
    PatternAnalysis,
    Debugging,
    Correction,
    Testing,
    Recovery,
    Monitoring,
    Execution,
    Generation,
    Custom(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::ErrorAggregation => "error_aggregation",
            Capability::PatternAnalysis => "pattern_analysis",
            Capability::Debugging => "debugging",
            Capability::Correction => "correction",
            Capability::Testing => "testing",
            Capability::Recovery => "recovery",
            Capability::Monitoring => "monitoring",
            Capability::Execution => "execution",
            Capability::Generation => "generation",
            Capability::Custom(name) => name,
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "error_aggregation" => Capability::ErrorAggregation,
            "pattern_analysis" => Capability::PatternAnalysis,
            "debugging" => Capability::Debugging,
            "correction" => Capability::Correction,
            "testing" => Capability::Testing,
            "recovery" => Capability::Recovery,
            "monitoring" => Capability::Monitoring,
            "execution" => Capability::Execution,
            "generation" => Capability::Generation,
            other => Capability::Custom(other.to_string()),
        }
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability::from(s.as_str())
    }
}

impl From<Capability> for String {
    fn from(cap: Capability) -> Self {
        cap.as_str().to_string()
    }
}

impl std::str::FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Capability::from(s))
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Broad role of a worker kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerCategory {
    Aggregation,
    Analysis,
    Debugging,
    Correction,
    Testing,
    Recovery,
    Monitoring,
    #[default]
    General,
}

/// Static description of a worker kind, supplied at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: WorkerCategory,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Tie-breaker in consensus voting; higher wins.
    #[serde(default)]
    pub priority_weight: u32,
}

fn default_max_instances() -> usize {
    4
}

impl WorkerDescriptor {
    pub fn new(kind: impl Into<String>, category: WorkerCategory) -> Self {
        Self {
            kind: kind.into(),
            description: String::new(),
            category,
            capabilities: BTreeSet::new(),
            tags: BTreeSet::new(),
            min_instances: 0,
            max_instances: default_max_instances(),
            priority_weight: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_instances(mut self, min: usize, max: usize) -> Self {
        self.min_instances = min;
        self.max_instances = max;
        self
    }

    pub fn with_priority_weight(mut self, weight: u32) -> Self {
        self.priority_weight = weight;
        self
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    fn validate(&self) -> TaskforgeResult<()> {
        if self.kind.trim().is_empty() {
            return Err(TaskforgeError::Config(
                "worker kind name must not be empty".into(),
            ));
        }
        if self.max_instances == 0 {
            return Err(TaskforgeError::Config(format!(
                "worker kind '{}' must allow at least one instance",
                self.kind
            )));
        }
        if self.min_instances > self.max_instances {
            return Err(TaskforgeError::Config(format!(
                "worker kind '{}' has min_instances {} above max_instances {}",
                self.kind, self.min_instances, self.max_instances
            )));
        }
        Ok(())
    }
}

/// A registered kind: its descriptor plus the builder for new instances.
#[derive(Clone)]
pub struct RegisteredKind {
    pub descriptor: WorkerDescriptor,
    pub builder: Arc<dyn WorkerBuilder>,
}

#[derive(Default)]
struct RegistryInner {
    kinds: HashMap<String, RegisteredKind>,
    by_capability: HashMap<Capability, BTreeSet<String>>,
    by_category: HashMap<WorkerCategory, BTreeSet<String>>,
    by_tag: HashMap<String, BTreeSet<String>>,
}

impl RegistryInner {
    fn rebuild_indices(&mut self) {
        self.by_capability.clear();
        self.by_category.clear();
        self.by_tag.clear();
        for (name, kind) in &self.kinds {
            let d = &kind.descriptor;
            for cap in &d.capabilities {
                self.by_capability
                    .entry(cap.clone())
                    .or_default()
                    .insert(name.clone());
            }
            self.by_category
                .entry(d.category)
                .or_default()
                .insert(name.clone());
            for tag in &d.tags {
                self.by_tag.entry(tag.clone()).or_default().insert(name.clone());
            }
        }
    }
}

/// Catalog of worker kinds with capability, category and tag indices.
///
/// Mutations are rare and take the global write lock; lookups share a read lock.
pub struct WorkerRegistry {
    inner: RwLock<RegistryInner>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Add or overwrite a kind and rebuild the indices.
    pub fn register(
        &self,
        descriptor: WorkerDescriptor,
        builder: Arc<dyn WorkerBuilder>,
    ) -> TaskforgeResult<()> {
        descriptor.validate()?;
        let mut inner = self.inner.write();
        let name = descriptor.kind.clone();
        info!(
            kind = %name,
            capabilities = descriptor.capabilities.len(),
            max_instances = descriptor.max_instances,
            "Registered worker kind"
        );
        inner
            .kinds
            .insert(name, RegisteredKind { descriptor, builder });
        inner.rebuild_indices();
        Ok(())
    }

    pub fn deregister(&self, kind: &str) -> Option<WorkerDescriptor> {
        let mut inner = self.inner.write();
        let removed = inner.kinds.remove(kind)?;
        inner.rebuild_indices();
        info!(kind = %kind, "Deregistered worker kind");
        Some(removed.descriptor)
    }

    pub fn get(&self, kind: &str) -> Option<RegisteredKind> {
        self.inner.read().kinds.get(kind).cloned()
    }

    pub fn descriptor(&self, kind: &str) -> Option<WorkerDescriptor> {
        self.inner
            .read()
            .kinds
            .get(kind)
            .map(|k| k.descriptor.clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.inner.read().kinds.contains_key(kind)
    }

    /// All kind names, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.inner.read().kinds.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        let mut all: Vec<WorkerDescriptor> = self
            .inner
            .read()
            .kinds
            .values()
            .map(|k| k.descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.kind.cmp(&b.kind));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.read().kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find_by_capability(&self, capability: &Capability) -> Vec<String> {
        self.inner
            .read()
            .by_capability
            .get(capability)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_by_category(&self, category: WorkerCategory) -> Vec<String> {
        self.inner
            .read()
            .by_category
            .get(&category)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_by_tag(&self, tag: &str) -> Vec<String> {
        self.inner
            .read()
            .by_tag
            .get(tag)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Kinds matching every given filter. No filters returns every kind.
    pub fn search(
        &self,
        category: Option<WorkerCategory>,
        capabilities: &[Capability],
        tags: &[&str],
    ) -> Vec<String> {
        let inner = self.inner.read();
        let mut result: BTreeSet<String> = inner.kinds.keys().cloned().collect();

        if let Some(category) = category {
            let matching = inner.by_category.get(&category);
            result.retain(|k| matching.is_some_and(|set| set.contains(k)));
        }
        for cap in capabilities {
            let matching = inner.by_capability.get(cap);
            result.retain(|k| matching.is_some_and(|set| set.contains(k)));
        }
        for tag in tags {
            let matching = inner.by_tag.get(*tag);
            result.retain(|k| matching.is_some_and(|set| set.contains(k)));
        }
        result.into_iter().collect()
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::Task;
    use crate::worker::{worker_builder, Worker};
    use async_trait::async_trait;
    use taskforge_core::TaskforgeResult;
    use tokio_util::sync::CancellationToken;

    struct Nop;

    #[async_trait]
    impl Worker for Nop {
        async fn execute(
            &self,
            _task: &Task,
            _cancel: CancellationToken,
        ) -> TaskforgeResult<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    fn registry() -> WorkerRegistry {
        let registry = WorkerRegistry::new();
        registry
            .register(
                WorkerDescriptor::new("debugger", WorkerCategory::Debugging)
                    .with_capabilities([Capability::Debugging, Capability::PatternAnalysis])
                    .with_tag("rust"),
                worker_builder(|| Nop),
            )
            .unwrap();
        registry
            .register(
                WorkerDescriptor::new("fixer", WorkerCategory::Correction)
                    .with_capabilities([Capability::Correction, Capability::Testing])
                    .with_tag("rust")
                    .with_tag("python"),
                worker_builder(|| Nop),
            )
            .unwrap();
        registry
            .register(
                WorkerDescriptor::new("tester", WorkerCategory::Testing)
                    .with_capability(Capability::Testing)
                    .with_tag("python"),
                worker_builder(|| Nop),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_find_by_indices() {
        let registry = registry();
        assert_eq!(
            registry.find_by_capability(&Capability::Testing),
            vec!["fixer", "tester"]
        );
        assert_eq!(
            registry.find_by_category(WorkerCategory::Debugging),
            vec!["debugger"]
        );
        assert_eq!(registry.find_by_tag("python"), vec!["fixer", "tester"]);
        assert!(registry.find_by_tag("go").is_empty());
    }

    #[test]
    fn test_search_intersects_filters() {
        let registry = registry();
        assert_eq!(
            registry.search(None, &[Capability::Testing], &["rust"]),
            vec!["fixer"]
        );
        assert_eq!(
            registry.search(Some(WorkerCategory::Testing), &[Capability::Testing], &[]),
            vec!["tester"]
        );
        assert_eq!(registry.search(None, &[], &[]).len(), 3);
        assert!(registry
            .search(Some(WorkerCategory::Recovery), &[], &[])
            .is_empty());
    }

    #[test]
    fn test_overwrite_rebuilds_index() {
        let registry = registry();
        registry
            .register(
                WorkerDescriptor::new("tester", WorkerCategory::Monitoring)
                    .with_capability(Capability::Monitoring),
                worker_builder(|| Nop),
            )
            .unwrap();
        assert_eq!(
            registry.find_by_capability(&Capability::Testing),
            vec!["fixer"]
        );
        assert_eq!(registry.find_by_tag("python"), vec!["fixer"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_deregister() {
        let registry = registry();
        assert!(registry.deregister("debugger").is_some());
        assert!(registry.deregister("debugger").is_none());
        assert!(registry
            .find_by_capability(&Capability::Debugging)
            .is_empty());
        assert!(!registry.contains("debugger"));
    }

    #[test]
    fn test_invalid_descriptor_rejected() {
        let registry = WorkerRegistry::new();
        let err = registry
            .register(
                WorkerDescriptor::new("bad", WorkerCategory::General).with_instances(3, 1),
                worker_builder(|| Nop),
            )
            .unwrap_err();
        assert!(matches!(err, TaskforgeError::Config(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capability_string_form() {
        let json = serde_json::to_string(&Capability::PatternAnalysis).unwrap();
        assert_eq!(json, "\"pattern_analysis\"");
        let custom: Capability = serde_json::from_str("\"terrain\"").unwrap();
        assert_eq!(custom, Capability::Custom("terrain".into()));
        assert_eq!("Testing".parse::<Capability>().unwrap(), Capability::Testing);
    }
}

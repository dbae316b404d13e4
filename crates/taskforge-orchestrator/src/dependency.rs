use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use taskforge_core::TaskId;

/// Dependency bookkeeping shared by the scheduler and the workspace distributor.
///
/// Tracks which tasks wait on which, so that completing a task releases the
/// dependents whose last unmet dependency it was.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// dependency -> tasks waiting on it
    dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    /// blocked task -> dependencies not yet completed
    unmet: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `task` until every id in `unmet` has completed.
    pub fn block(&mut self, task: TaskId, unmet: impl IntoIterator<Item = TaskId>) {
        let unmet: HashSet<TaskId> = unmet.into_iter().collect();
        if unmet.is_empty() {
            return;
        }
        for dep in &unmet {
            self.dependents.entry(*dep).or_default().insert(task);
        }
        self.unmet.entry(task).or_default().extend(unmet);
    }

    pub fn is_blocked(&self, task: &TaskId) -> bool {
        self.unmet.get(task).is_some_and(|deps| !deps.is_empty())
    }

    pub fn unmet(&self, task: &TaskId) -> Vec<TaskId> {
        self.unmet
            .get(task)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn blocked_count(&self) -> usize {
        self.unmet.len()
    }

    /// Record that `dep` completed. Returns the tasks it unblocked.
    pub fn complete(&mut self, dep: &TaskId) -> Vec<TaskId> {
        let Some(waiting) = self.dependents.remove(dep) else {
            return Vec::new();
        };
        let mut ready = Vec::new();
        for task in waiting {
            if let Some(deps) = self.unmet.get_mut(&task) {
                deps.remove(dep);
                if deps.is_empty() {
                    self.unmet.remove(&task);
                    ready.push(task);
                }
            }
        }
        ready
    }

    /// Record that `dep` will never complete. Returns every task that
    /// transitively depended on it, breadth-first; they are removed from the graph.
    pub fn fail(&mut self, dep: &TaskId) -> Vec<TaskId> {
        let mut doomed = Vec::new();
        let mut seen = HashSet::new();
        let mut frontier = VecDeque::from([*dep]);
        while let Some(current) = frontier.pop_front() {
            let Some(waiting) = self.dependents.remove(&current) else {
                continue;
            };
            for task in waiting {
                if seen.insert(task) {
                    doomed.push(task);
                    frontier.push_back(task);
                }
            }
        }
        for task in &doomed {
            self.remove(task);
        }
        doomed
    }

    /// Forget a blocked task (cancelled or failed while parked).
    pub fn remove(&mut self, task: &TaskId) {
        if let Some(deps) = self.unmet.remove(task) {
            for dep in deps {
                if let Some(waiting) = self.dependents.get_mut(&dep) {
                    waiting.remove(task);
                    if waiting.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }

    /// Whether blocking `task` on `deps` would close a cycle among parked tasks.
    pub fn would_cycle(&self, task: TaskId, deps: &[TaskId]) -> bool {
        if deps.contains(&task) {
            return true;
        }
        let mut visited = HashMap::new();
        visited.insert(task, 1u8);
        deps.iter().any(|d| self.dfs_cycle(*d, &mut visited))
    }

    /// Check for cycles among parked tasks.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.unmet
            .keys()
            .any(|id| self.dfs_cycle(*id, &mut visited))
    }

    fn dfs_cycle(&self, id: TaskId, visited: &mut HashMap<TaskId, u8>) -> bool {
        match visited.get(&id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(deps) = self.unmet.get(&id) {
            for dep in deps {
                if self.dfs_cycle(*dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_release_on_last_dependency() {
        let mut graph = DependencyGraph::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        graph.block(c, [a, b]);
        assert!(graph.is_blocked(&c));

        assert!(graph.complete(&a).is_empty());
        assert!(graph.is_blocked(&c));
        assert_eq!(graph.complete(&b), vec![c]);
        assert!(!graph.is_blocked(&c));
        assert_eq!(graph.blocked_count(), 0);
    }

    #[test]
    fn test_fail_cascades_transitively() {
        let mut graph = DependencyGraph::new();
        let (a, b, c, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let other = Uuid::new_v4();
        graph.block(b, [a]);
        graph.block(c, [b]);
        graph.block(d, [c, other]);

        let doomed = graph.fail(&a);
        assert_eq!(doomed, vec![b, c, d]);
        assert_eq!(graph.blocked_count(), 0);
        assert!(graph.complete(&other).is_empty());
    }

    #[test]
    fn test_remove_cleans_reverse_edges() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        graph.block(b, [a]);
        graph.remove(&b);
        assert!(graph.complete(&a).is_empty());
    }

    #[test]
    fn test_no_cycle() {
        let mut graph = DependencyGraph::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        graph.block(b, [a]);
        graph.block(c, [b]);
        assert!(!graph.has_cycle());
        assert!(!graph.would_cycle(Uuid::new_v4(), &[c]));
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        graph.block(b, [a]);
        assert!(graph.would_cycle(a, &[b]));
        assert!(graph.would_cycle(a, &[a]));
        graph.block(a, [b]);
        assert!(graph.has_cycle());
    }
}

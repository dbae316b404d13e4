use crate::types::{Task, TaskStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use taskforge_core::TaskId;

/// Lifetime counts of terminal tasks, unaffected by history eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalTotals {
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Every live task plus a bounded history of finished ones.
#[derive(Debug)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    history: VecDeque<TaskId>,
    history_limit: usize,
    totals: TerminalTotals,
}

impl TaskStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
            totals: TerminalTotals::default(),
        }
    }

    pub fn insert(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Move a task that just reached a terminal state into history,
    /// evicting the oldest entries past the limit.
    pub fn archive(&mut self, id: TaskId) -> Vec<TaskId> {
        let Some(task) = self.tasks.get(&id) else {
            return Vec::new();
        };
        match task.status {
            TaskStatus::Completed => self.totals.completed += 1,
            TaskStatus::Failed => self.totals.failed += 1,
            TaskStatus::Cancelled => self.totals.cancelled += 1,
            _ => return Vec::new(),
        }
        self.history.push_back(id);

        let mut evicted = Vec::new();
        while self.history.len() > self.history_limit {
            if let Some(old) = self.history.pop_front() {
                self.tasks.remove(&old);
                evicted.push(old);
            }
        }
        evicted
    }

    /// Most recent terminal tasks, newest first.
    pub fn recent(&self, limit: usize) -> Vec<&Task> {
        self.history
            .iter()
            .rev()
            .filter_map(|id| self.tasks.get(id))
            .take(limit)
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn totals(&self) -> TerminalTotals {
        self.totals
    }

    pub fn count_in(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::SubmitRequest;

    fn finished(status: TaskStatus) -> Task {
        let mut task = Task::from_request(SubmitRequest::new("w"), 0);
        task.transition(TaskStatus::Queued).unwrap();
        match status {
            TaskStatus::Completed => {
                task.transition(TaskStatus::Assigned).unwrap();
                task.transition(TaskStatus::InProgress).unwrap();
                task.transition(TaskStatus::Completed).unwrap();
            }
            other => task.transition(other).unwrap(),
        }
        task
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut store = TaskStore::new(2);
        let ids: Vec<TaskId> = (0..3)
            .map(|_| {
                let task = finished(TaskStatus::Completed);
                let id = task.id;
                store.insert(task);
                id
            })
            .collect();

        assert!(store.archive(ids[0]).is_empty());
        assert!(store.archive(ids[1]).is_empty());
        assert_eq!(store.archive(ids[2]), vec![ids[0]]);
        assert!(store.get(&ids[0]).is_none());
        assert_eq!(store.history_len(), 2);
        assert_eq!(store.totals().completed, 3);
        assert_eq!(store.recent(10)[0].id, ids[2]);
    }

    #[test]
    fn test_archive_ignores_live_tasks() {
        let mut store = TaskStore::new(4);
        let task = Task::from_request(SubmitRequest::new("w"), 0);
        let id = task.id;
        store.insert(task);
        assert!(store.archive(id).is_empty());
        assert_eq!(store.history_len(), 0);
        assert_eq!(store.count_in(TaskStatus::Pending), 1);
    }

    #[test]
    fn test_totals_by_outcome() {
        let mut store = TaskStore::new(10);
        for status in [TaskStatus::Failed, TaskStatus::Cancelled, TaskStatus::Failed] {
            let task = finished(status);
            let id = task.id;
            store.insert(task);
            store.archive(id);
        }
        let totals = store.totals();
        assert_eq!(totals.failed, 2);
        assert_eq!(totals.cancelled, 1);
        assert_eq!(totals.completed, 0);
    }
}

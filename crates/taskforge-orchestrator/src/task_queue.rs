use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use taskforge_core::{Priority, TaskId, TaskforgeError, TaskforgeResult};

type QueueKey = (Reverse<Priority>, u64);

/// Bounded priority queue of ready task ids.
///
/// Higher priority first; inside one tier, lower submission sequence first.
/// Entries can be removed from the middle (cancellation, deferral).
#[derive(Debug)]
pub struct TaskQueue {
    order: BTreeMap<QueueKey, TaskId>,
    index: HashMap<TaskId, QueueKey>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: BTreeMap::new(),
            index: HashMap::new(),
            capacity,
        }
    }

    /// Enqueue a task. Re-pushing an id already queued is a no-op.
    pub fn push(&mut self, id: TaskId, priority: Priority, sequence: u64) -> TaskforgeResult<()> {
        if self.index.contains_key(&id) {
            return Ok(());
        }
        if self.order.len() >= self.capacity {
            return Err(TaskforgeError::Capacity(format!(
                "Task queue is full ({} entries)",
                self.capacity
            )));
        }
        let key = (Reverse(priority), sequence);
        self.order.insert(key, id);
        self.index.insert(id, key);
        Ok(())
    }

    /// Remove and return the highest-priority, oldest entry.
    pub fn pop(&mut self) -> Option<TaskId> {
        let (_, id) = self.order.pop_first()?;
        self.index.remove(&id);
        Some(id)
    }

    pub fn peek(&self) -> Option<TaskId> {
        self.order.values().next().copied()
    }

    pub fn remove(&mut self, id: &TaskId) -> bool {
        match self.index.remove(id) {
            Some(key) => {
                self.order.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    /// Ids in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.order.values().copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.order.len() >= self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_empty_queue() {
        let mut queue = TaskQueue::new(4);
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = TaskQueue::new(16);
        let low: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for (seq, id) in low.iter().enumerate() {
            queue.push(*id, Priority::Low, seq as u64).unwrap();
        }
        let critical = Uuid::new_v4();
        queue.push(critical, Priority::Critical, 5).unwrap();

        assert_eq!(queue.pop(), Some(critical));
        for id in &low {
            assert_eq!(queue.pop(), Some(*id));
        }
    }

    #[test]
    fn test_all_tiers_ordered() {
        let mut queue = TaskQueue::new(16);
        let mut expected = Vec::new();
        for (seq, priority) in Priority::ALL.iter().rev().enumerate() {
            let id = Uuid::new_v4();
            queue.push(id, *priority, seq as u64).unwrap();
            expected.push((id, *priority));
        }
        expected.sort_by(|a, b| b.1.cmp(&a.1));
        let order: Vec<Uuid> = queue.iter().collect();
        assert_eq!(order, expected.iter().map(|e| e.0).collect::<Vec<_>>());
    }

    #[test]
    fn test_bounded() {
        let mut queue = TaskQueue::new(2);
        queue.push(Uuid::new_v4(), Priority::Low, 0).unwrap();
        queue.push(Uuid::new_v4(), Priority::Low, 1).unwrap();
        assert!(queue.is_full());
        let err = queue.push(Uuid::new_v4(), Priority::Critical, 2).unwrap_err();
        assert!(matches!(err, TaskforgeError::Capacity(_)));
    }

    #[test]
    fn test_remove_from_middle() {
        let mut queue = TaskQueue::new(8);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        queue.push(a, Priority::High, 0).unwrap();
        queue.push(b, Priority::High, 1).unwrap();
        queue.push(c, Priority::High, 2).unwrap();
        assert!(queue.remove(&b));
        assert!(!queue.remove(&b));
        assert!(!queue.contains(&b));
        assert_eq!(queue.iter().collect::<Vec<_>>(), vec![a, c]);
    }

    #[test]
    fn test_duplicate_push_ignored() {
        let mut queue = TaskQueue::new(8);
        let a = Uuid::new_v4();
        queue.push(a, Priority::High, 0).unwrap();
        queue.push(a, Priority::Low, 7).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek(), Some(a));
    }
}

//! Pending-task queue shared between the Controller-sync producer and the
//! reconciler.
//!
//! The queue holds at most one pending task per workload id. Removal tasks
//! always run before everything else; within each class, tasks run in
//! enqueue order. Two FIFO buckets make that stability structural instead
//! of relying on a tie-preserving priority heap.
//!
//! All operations take one short-lived mutex and never touch I/O; the
//! reconciler copies a task out, executes it unlocked, and re-locks only
//! to remove or defer it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::error;

use crate::task::{ContainerTask, TaskAction};

#[derive(Debug)]
struct Entry {
    task: ContainerTask,
    /// Transient-failure count for this task.
    attempts: u32,
    /// Backoff deadline; the entry is invisible to `peek_next` until then.
    eligible_at: Option<Instant>,
}

impl Entry {
    fn new(task: ContainerTask) -> Self {
        Self {
            task,
            attempts: 0,
            eligible_at: None,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        self.eligible_at.is_none_or(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Buckets {
    removals: VecDeque<Entry>,
    normal: VecDeque<Entry>,
}

impl Buckets {
    fn bucket_for(&mut self, action: TaskAction) -> &mut VecDeque<Entry> {
        match action {
            TaskAction::Remove => &mut self.removals,
            TaskAction::Add | TaskAction::Update => &mut self.normal,
        }
    }
}

/// Deduplicated, priority-ordered holder of pending [`ContainerTask`]s.
#[derive(Debug, Default)]
pub struct TaskQueue {
    inner: Mutex<Buckets>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task, replacing any pending task for the same workload.
    ///
    /// Last write wins: the replacement resets retry bookkeeping. When the
    /// replacement stays in the same priority class it keeps the original
    /// queue position; a class change (a pending add absorbed by a removal)
    /// moves it to the back of the new bucket.
    pub fn enqueue(&self, task: ContainerTask) {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");

        let in_removals = inner.removals.iter().position(|e| e.task == task);
        let in_normal = inner.normal.iter().position(|e| e.task == task);

        if let (Some(removal_pos), Some(normal_pos)) = (in_removals, in_normal) {
            // Invariant violation: one pending task per workload id. Repair
            // by dropping both stale entries and keeping the newcomer.
            error!(
                element_id = %task.element_id,
                "task present in both queue buckets, repairing"
            );
            inner.removals.remove(removal_pos);
            inner.normal.remove(normal_pos);
            inner.bucket_for(task.action).push_back(Entry::new(task));
            return;
        }

        let same_class = match task.action {
            TaskAction::Remove => in_removals,
            TaskAction::Add | TaskAction::Update => in_normal,
        };

        if let Some(pos) = same_class {
            let bucket = inner.bucket_for(task.action);
            bucket[pos] = Entry::new(task);
            return;
        }

        if let Some(pos) = in_removals {
            inner.removals.remove(pos);
        } else if let Some(pos) = in_normal {
            inner.normal.remove(pos);
        }
        inner.bucket_for(task.action).push_back(Entry::new(task));
    }

    /// Return, without removing, the next task eligible for execution:
    /// the oldest eligible removal, else the oldest eligible non-removal.
    pub fn peek_next(&self) -> Option<ContainerTask> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("task queue lock poisoned");
        inner
            .removals
            .iter()
            .find(|e| e.eligible(now))
            .or_else(|| inner.normal.iter().find(|e| e.eligible(now)))
            .map(|e| e.task.clone())
    }

    /// Drop the pending task for this workload. Returns whether one existed.
    pub fn remove(&self, task: &ContainerTask) -> bool {
        let mut inner = self.inner.lock().expect("task queue lock poisoned");

        if let Some(pos) = inner.removals.iter().position(|e| e.task == *task) {
            inner.removals.remove(pos);
            return true;
        }
        if let Some(pos) = inner.normal.iter().position(|e| e.task == *task) {
            inner.normal.remove(pos);
            return true;
        }
        false
    }

    /// Record a transient failure: bump the task's attempt counter and hide
    /// it from `peek_next` for the delay the schedule assigns to that count.
    /// Returns the new attempt count, or `None` if the task is no longer
    /// pending.
    pub fn defer(
        &self,
        task: &ContainerTask,
        delay_for: impl FnOnce(u32) -> Duration,
    ) -> Option<u32> {
        let mut guard = self.inner.lock().expect("task queue lock poisoned");
        let inner = &mut *guard;
        let entry = inner
            .removals
            .iter_mut()
            .chain(inner.normal.iter_mut())
            .find(|e| e.task == *task)?;

        entry.attempts += 1;
        entry.eligible_at = Some(Instant::now() + delay_for(entry.attempts));
        Some(entry.attempts)
    }

    /// Number of pending tasks, including ones currently backing off.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("task queue lock poisoned");
        inner.removals.len() + inner.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::task::PortMapping;

    fn add(id: &str) -> ContainerTask {
        ContainerTask {
            action: TaskAction::Add,
            element_id: id.to_string(),
            image: format!("registry.example.com/{id}:latest"),
            ports: vec![PortMapping {
                outside: 8080,
                inside: 80,
            }],
            volumes: vec![],
            env: BTreeMap::new(),
            registry: None,
        }
    }

    fn update(id: &str) -> ContainerTask {
        let mut task = add(id);
        task.action = TaskAction::Update;
        task
    }

    #[test]
    fn test_enqueue_dedups_last_write_wins() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));
        queue.enqueue(update("svc1"));

        assert_eq!(queue.len(), 1);
        let next = queue.peek_next().unwrap();
        assert_eq!(next.action, TaskAction::Update);
    }

    #[test]
    fn test_removals_run_before_older_adds() {
        let queue = TaskQueue::new();
        queue.enqueue(add("a"));
        queue.enqueue(add("b"));
        queue.enqueue(ContainerTask::remove("a"));

        // The removal for `a` absorbed its pending add and jumped the line.
        assert_eq!(queue.len(), 2);
        let first = queue.peek_next().unwrap();
        assert_eq!(first.action, TaskAction::Remove);
        assert_eq!(first.element_id, "a");

        queue.remove(&first);
        let second = queue.peek_next().unwrap();
        assert_eq!(second.action, TaskAction::Add);
        assert_eq!(second.element_id, "b");
    }

    #[test]
    fn test_fifo_within_class_is_stable() {
        let queue = TaskQueue::new();
        for id in ["a", "b", "c"] {
            queue.enqueue(add(id));
        }
        // Replacing `a` in the same class keeps its position.
        queue.enqueue(update("a"));

        let first = queue.peek_next().unwrap();
        assert_eq!(first.element_id, "a");
        assert_eq!(first.action, TaskAction::Update);

        queue.remove(&first);
        assert_eq!(queue.peek_next().unwrap().element_id, "b");
    }

    #[test]
    fn test_removal_over_add_replaces_not_duplicates() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));
        queue.enqueue(ContainerTask::remove("svc1"));
        queue.enqueue(ContainerTask::remove("svc1"));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_next().unwrap().action, TaskAction::Remove);
    }

    #[test]
    fn test_peek_on_empty_queue() {
        let queue = TaskQueue::new();
        assert!(queue.peek_next().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let queue = TaskQueue::new();
        let task = add("svc1");
        queue.enqueue(task.clone());

        assert!(queue.remove(&task));
        assert!(!queue.remove(&task));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_defer_hides_task_until_deadline() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));

        let attempts = queue
            .defer(&add("svc1"), |_| Duration::from_secs(60))
            .unwrap();
        assert_eq!(attempts, 1);

        // Still pending, but not eligible.
        assert_eq!(queue.len(), 1);
        assert!(queue.peek_next().is_none());
    }

    #[test]
    fn test_defer_skips_to_next_eligible_task() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));
        queue.enqueue(add("svc2"));

        queue.defer(&add("svc1"), |_| Duration::from_secs(60)).unwrap();

        // svc1 backs off; svc2 is served in the meantime.
        assert_eq!(queue.peek_next().unwrap().element_id, "svc2");
    }

    #[test]
    fn test_defer_with_zero_delay_stays_eligible() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));

        queue.defer(&add("svc1"), |_| Duration::ZERO).unwrap();
        assert_eq!(queue.peek_next().unwrap().element_id, "svc1");
    }

    #[test]
    fn test_defer_counts_attempts() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));

        for expected in 1..=3 {
            let attempts = queue.defer(&add("svc1"), |_| Duration::ZERO).unwrap();
            assert_eq!(attempts, expected);
        }
    }

    #[test]
    fn test_replacement_resets_attempts() {
        let queue = TaskQueue::new();
        queue.enqueue(add("svc1"));
        queue.defer(&add("svc1"), |_| Duration::from_secs(60)).unwrap();

        // A fresh diff for the same workload is a new intent.
        queue.enqueue(add("svc1"));
        assert_eq!(queue.peek_next().unwrap().element_id, "svc1");
        let attempts = queue.defer(&add("svc1"), |_| Duration::ZERO).unwrap();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_defer_missing_task() {
        let queue = TaskQueue::new();
        assert!(queue.defer(&add("absent"), |_| Duration::ZERO).is_none());
    }
}

//! TaskQueue implementation

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, info};

use crate::domain::{Task, TaskStatus};

use super::error::TaskQueueError;
use super::pending::PendingEntry;

/// Observer notified synchronously after every status transition
///
/// Observers fire in registration order, after the task has been mutated and
/// before the transition method returns.
pub trait TaskObserver: Send + Sync {
    fn on_transition(&self, task: &Task, from: TaskStatus, to: TaskStatus);
}

impl<F> TaskObserver for F
where
    F: Fn(&Task, TaskStatus, TaskStatus) + Send + Sync,
{
    fn on_transition(&self, task: &Task, from: TaskStatus, to: TaskStatus) {
        self(task, from, to)
    }
}

/// Internal state protected by mutex
#[derive(Default)]
struct QueueInner {
    /// Every task ever created, by ID
    tasks: HashMap<String, Task>,

    /// Pending pool ordered by (priority, created_at)
    heap: BinaryHeap<PendingEntry>,

    /// Live heap sequence per pooled task; heap entries with any other sequence are stale
    pooled: HashMap<String, u64>,

    next_seq: u64,
}

impl QueueInner {
    fn push_pending(&mut self, task: &Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pooled.insert(task.id.clone(), seq);
        self.heap.push(PendingEntry {
            task_id: task.id.clone(),
            priority: task.priority,
            created_at: task.created_at,
            seq,
        });
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }
}

/// Task lifecycle state machine plus a priority-ordered pending pool
///
/// Tasks are never deleted; terminal tasks remain queryable for the life of
/// the run. All reads hand out clones, so callers never share task state.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    observers: RwLock<Vec<Arc<dyn TaskObserver>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        debug!("TaskQueue::new: called");
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer for status transitions
    pub fn add_observer(&self, observer: Arc<dyn TaskObserver>) {
        debug!("TaskQueue::add_observer: called");
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn notify(&self, task: &Task, from: TaskStatus, to: TaskStatus) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            observer.on_transition(task, from, to);
        }
    }

    /// Add a new task to the pending pool
    pub fn enqueue(&self, task: Task) -> Result<(), TaskQueueError> {
        debug!(task_id = %task.id, priority = task.priority, "TaskQueue::enqueue: called");
        if task.status != TaskStatus::Pending {
            return Err(TaskQueueError::NotPending {
                task_id: task.id,
                status: task.status,
            });
        }

        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(TaskQueueError::Duplicate(task.id));
        }
        inner.push_pending(&task);
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Track a pending task without placing it in the pending pool
    ///
    /// Used for subtasks, which their subplanner dispatches directly.
    pub fn register(&self, task: Task) -> Result<(), TaskQueueError> {
        debug!(task_id = %task.id, "TaskQueue::register: called");
        if task.status != TaskStatus::Pending {
            return Err(TaskQueueError::NotPending {
                task_id: task.id,
                status: task.status,
            });
        }

        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(TaskQueueError::Duplicate(task.id));
        }
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    /// Pop the most urgent pending task
    pub fn get_next_pending(&self) -> Option<Task> {
        let mut inner = self.lock();
        while let Some(entry) = inner.heap.pop() {
            if inner.pooled.get(&entry.task_id) != Some(&entry.seq) {
                debug!(task_id = %entry.task_id, "TaskQueue::get_next_pending: skipping stale entry");
                continue;
            }
            inner.pooled.remove(&entry.task_id);

            match inner.tasks.get(&entry.task_id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    debug!(task_id = %task.id, "TaskQueue::get_next_pending: popped");
                    return Some(task.clone());
                }
                _ => continue,
            }
        }
        None
    }

    /// Validate and apply a transition, then notify observers
    fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task, TaskQueueError> {
        let (snapshot, from) = {
            let mut inner = self.lock();
            let task = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskQueueError::NotFound(task_id.to_string()))?;
            let from = task.status;
            if !from.can_transition_to(to) {
                debug!(%task_id, %from, %to, "TaskQueue::transition: rejected");
                return Err(TaskQueueError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from,
                    to,
                });
            }
            task.status = to;
            mutate(task);
            let snapshot = task.clone();
            if from == TaskStatus::Pending {
                inner.pooled.remove(task_id);
            }
            (snapshot, from)
        };

        info!(task_id = %snapshot.id, parent_id = ?snapshot.parent_id, %from, %to, "Task status");
        self.notify(&snapshot, from, to);
        Ok(snapshot)
    }

    /// pending -> assigned
    pub fn assign_task(&self, task_id: &str, worker_id: &str) -> Result<Task, TaskQueueError> {
        debug!(%task_id, %worker_id, "TaskQueue::assign_task: called");
        let worker_id = worker_id.to_string();
        self.transition(task_id, TaskStatus::Assigned, |task| {
            task.assigned_to = Some(worker_id);
        })
    }

    /// assigned -> running
    pub fn start_task(&self, task_id: &str) -> Result<Task, TaskQueueError> {
        debug!(%task_id, "TaskQueue::start_task: called");
        self.transition(task_id, TaskStatus::Running, |task| {
            task.started_at = Some(Utc::now());
        })
    }

    /// running -> complete
    pub fn complete_task(&self, task_id: &str) -> Result<Task, TaskQueueError> {
        debug!(%task_id, "TaskQueue::complete_task: called");
        self.transition(task_id, TaskStatus::Complete, |task| {
            task.completed_at = Some(Utc::now());
        })
    }

    /// running -> failed
    pub fn fail_task(&self, task_id: &str) -> Result<Task, TaskQueueError> {
        debug!(%task_id, "TaskQueue::fail_task: called");
        self.transition(task_id, TaskStatus::Failed, |task| {
            task.completed_at = Some(Utc::now());
        })
    }

    /// {pending, assigned, running} -> cancelled
    pub fn cancel_task(&self, task_id: &str) -> Result<Task, TaskQueueError> {
        debug!(%task_id, "TaskQueue::cancel_task: called");
        self.transition(task_id, TaskStatus::Cancelled, |task| {
            task.completed_at = Some(Utc::now());
        })
    }

    /// Move a failed task back into the pending pool
    ///
    /// Returns false (and changes nothing) unless the task is `failed`.
    pub fn retry_task(&self, task_id: &str) -> bool {
        debug!(%task_id, "TaskQueue::retry_task: called");
        let snapshot = {
            let mut inner = self.lock();
            let Some(task) = inner.tasks.get_mut(task_id) else {
                debug!(%task_id, "TaskQueue::retry_task: not found");
                return false;
            };
            if task.status != TaskStatus::Failed {
                debug!(%task_id, status = %task.status, "TaskQueue::retry_task: not failed, ignoring");
                return false;
            }
            task.status = TaskStatus::Pending;
            task.assigned_to = None;
            task.started_at = None;
            task.completed_at = None;
            task.retry_count += 1;
            let snapshot = task.clone();
            inner.push_pending(&snapshot);
            snapshot
        };

        info!(task_id = %snapshot.id, retry_count = snapshot.retry_count, "Task requeued for retry");
        self.notify(&snapshot, TaskStatus::Failed, TaskStatus::Pending);
        true
    }

    /// Get a copy of a task by ID
    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.lock().tasks.get(task_id).cloned()
    }

    /// Copies of all tasks with the given status
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<Task> {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect()
    }

    /// Copies of every task, ordered by creation time
    pub fn all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn total_count(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn get_pending_count(&self) -> usize {
        self.lock().count(TaskStatus::Pending)
    }

    pub fn get_running_count(&self) -> usize {
        self.lock().count(TaskStatus::Running)
    }

    /// Assigned plus running
    pub fn get_active_count(&self) -> usize {
        let inner = self.lock();
        inner.count(TaskStatus::Assigned) + inner.count(TaskStatus::Running)
    }

    pub fn get_completed_count(&self) -> usize {
        self.lock().count(TaskStatus::Complete)
    }

    pub fn get_failed_count(&self) -> usize {
        self.lock().count(TaskStatus::Failed)
    }

    pub fn get_cancelled_count(&self) -> usize {
        self.lock().count(TaskStatus::Cancelled)
    }
}

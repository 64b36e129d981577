//! TaskDispatcher - runs tasks through the pool under one concurrency limit

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::pool::WorkerPool;
use crate::domain::{Handoff, HandoffStatus, Task, TaskStatus, generate_id};
use crate::events::{EventBus, SwarmEvent};
use crate::merge::MergeQueue;
use crate::monitor::Monitor;
use crate::queue::{TaskQueue, TaskQueueError};

/// Worker id recorded on tasks that are decomposed instead of dispatched
pub const SUBPLANNER_WORKER_ID: &str = "subplanner";

/// Moves tasks through their lifecycle around a sandbox run
///
/// One semaphore is shared by the planner and every subplanner, so the number
/// of sandboxes in flight never exceeds `workers.max-concurrent` no matter how
/// deep decomposition goes. The permit is held only while a sandbox runs.
pub struct TaskDispatcher {
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    merge: Arc<MergeQueue>,
    monitor: Arc<Monitor>,
    events: Arc<EventBus>,
    limiter: Arc<Semaphore>,
}

impl TaskDispatcher {
    pub fn new(
        queue: Arc<TaskQueue>,
        pool: Arc<WorkerPool>,
        merge: Arc<MergeQueue>,
        monitor: Arc<Monitor>,
        events: Arc<EventBus>,
        max_concurrent: usize,
    ) -> Self {
        debug!(max_concurrent, "TaskDispatcher::new: called");
        Self {
            queue,
            pool,
            merge,
            monitor,
            events,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Free dispatch slots right now
    pub fn available_slots(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Add a task to the pending pool
    pub fn submit(&self, task: Task) -> Result<(), TaskQueueError> {
        let event = created_event(&task);
        self.queue.enqueue(task)?;
        self.events.emit(event);
        Ok(())
    }

    /// Track a subtask that its subplanner dispatches itself
    pub fn register(&self, task: Task) -> Result<(), TaskQueueError> {
        let event = created_event(&task);
        self.queue.register(task)?;
        self.events.emit(event);
        Ok(())
    }

    /// Run one task in a sandbox and settle it from the handoff
    ///
    /// Never fails: dispatch errors come back as a `failed` handoff.
    pub async fn dispatch_leaf(&self, task: &Task, depth: u32) -> Handoff {
        debug!(task_id = %task.id, depth, "TaskDispatcher::dispatch_leaf: called");
        self.events.emit(SwarmEvent::Dispatching {
            task_id: task.id.clone(),
            branch: task.branch.clone(),
            depth,
        });

        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let handoff = Handoff::failed(task.id.clone(), "limiter closed");
                self.settle(task, &handoff, false);
                return handoff;
            }
        };

        let sandbox_id = generate_id("sandbox");
        if let Err(e) = self.begin(&task.id, &sandbox_id) {
            warn!(task_id = %task.id, error = %e, "Task could not be started");
            return Handoff::failed(task.id.clone(), format!("task could not be started: {}", e));
        }

        let handoff = match self.pool.assign_task(task).await {
            Ok(handoff) => handoff,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Dispatch failed");
                Handoff::failed(task.id.clone(), e.to_string())
            }
        };
        drop(permit);

        self.settle(task, &handoff, true);
        handoff
    }

    /// Mark a task as being decomposed rather than dispatched
    pub fn begin_decomposition(&self, task: &Task) -> Result<(), TaskQueueError> {
        debug!(task_id = %task.id, "TaskDispatcher::begin_decomposition: called");
        self.begin(&task.id, SUBPLANNER_WORKER_ID)
    }

    /// Settle a decomposed task from its aggregated handoff
    pub fn finish_decomposition(&self, task: &Task, handoff: &Handoff) {
        debug!(task_id = %task.id, status = %handoff.status, "TaskDispatcher::finish_decomposition: called");
        self.settle(task, handoff, false);
    }

    /// pending -> assigned -> running
    fn begin(&self, task_id: &str, worker_id: &str) -> Result<(), TaskQueueError> {
        self.queue.assign_task(task_id, worker_id)?;
        self.queue.start_task(task_id)?;
        Ok(())
    }

    /// Apply the handoff to the task; a leaf's branch is queued for merge only
    /// when the handoff is `complete`
    fn settle(&self, task: &Task, handoff: &Handoff, leaf: bool) {
        let to = handoff.status.task_status();
        let current = self.queue.get(&task.id).map(|t| t.status);
        if current == Some(TaskStatus::Running) {
            let result = match to {
                TaskStatus::Complete => self.queue.complete_task(&task.id),
                _ => self.queue.fail_task(&task.id),
            };
            if let Err(e) = result {
                warn!(task_id = %task.id, error = %e, "Failed to settle task");
            }
        } else {
            debug!(task_id = %task.id, ?current, "TaskDispatcher::settle: task not running, status left as is");
        }

        if leaf {
            self.monitor.record_handoff(handoff);
        }
        if leaf && handoff.status == HandoffStatus::Complete && !task.branch.is_empty() {
            self.merge.enqueue(&task.branch, task.priority);
        }

        info!(task_id = %task.id, status = %handoff.status, files = handoff.files_changed.len(), "Handoff received");
        self.events.emit(SwarmEvent::TaskCompleted {
            task_id: task.id.clone(),
            status: handoff.status,
            summary: handoff.summary.clone(),
            files_changed: handoff.files_changed.len(),
        });
    }
}

fn created_event(task: &Task) -> SwarmEvent {
    SwarmEvent::TaskCreated {
        task_id: task.id.clone(),
        parent_id: task.parent_id.clone(),
        description: task.description.clone(),
        priority: task.priority,
    }
}

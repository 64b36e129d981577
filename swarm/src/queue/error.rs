//! TaskQueue error types

use thiserror::Error;

use crate::domain::TaskStatus;

/// Errors returned by TaskQueue operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskQueueError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task {task_id} cannot be enqueued in status {status}")]
    NotPending { task_id: String, status: TaskStatus },

    #[error("Task already exists: {0}")]
    Duplicate(String),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

impl TaskQueueError {
    /// Check if this is a rejected state transition
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

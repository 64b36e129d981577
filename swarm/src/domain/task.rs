//! Task domain type
//!
//! A Task is the unit of work handed to one worker. Its status only moves
//! through the transitions in [`TaskStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::id::{branch_name, generate_task_id};

/// Priority given to tasks that don't specify one (lower = more urgent)
pub const DEFAULT_PRIORITY: u32 = 5;

/// Priority given to reconciler fix tasks so they precede feature work
pub const FIX_PRIORITY: u32 = 1;

/// Upper bound on fix tasks produced by one sweep
pub const MAX_FIX_TASKS: usize = 5;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the pending pool
    #[default]
    Pending,
    /// Handed to a worker, not yet started
    Assigned,
    /// Worker is executing
    Running,
    /// Worker reported success
    Complete,
    /// Worker reported failure or dispatch errored
    Failed,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    /// Whether the transition `self -> next` is in the state table
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Assigned)
                | (Self::Pending, Self::Cancelled)
                | (Self::Assigned, Self::Running)
                | (Self::Assigned, Self::Cancelled)
                | (Self::Running, Self::Complete)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    /// Terminal statuses have no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Assigned or running
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique, stable identifier
    pub id: String,

    /// Set when created by a subplanner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Self-contained description; the only context a worker receives
    pub description: String,

    /// File paths the task may touch
    #[serde(default)]
    pub scope: Vec<String>,

    /// Verifiable completion criteria
    #[serde(default)]
    pub acceptance: String,

    /// Git branch the worker commits to
    pub branch: String,

    pub status: TaskStatus,

    /// Lower is more urgent
    pub priority: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Opaque worker/sandbox identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    #[serde(default)]
    pub retry_count: u32,
}

impl Task {
    /// Create a pending task with a generated ID
    pub fn new(description: impl Into<String>, branch_prefix: &str) -> Self {
        Self::with_id(generate_task_id(), description, branch_prefix)
    }

    /// Create a pending task with an explicit ID
    pub fn with_id(id: impl Into<String>, description: impl Into<String>, branch_prefix: &str) -> Self {
        let id = id.into();
        let description = description.into();
        debug!(%id, "Task::with_id: called");
        Self {
            branch: branch_name(branch_prefix, &id, &description),
            id,
            parent_id: None,
            description,
            scope: Vec::new(),
            acceptance: String::new(),
            status: TaskStatus::Pending,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_to: None,
            retry_count: 0,
        }
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_acceptance(mut self, acceptance: impl Into<String>) -> Self {
        self.acceptance = acceptance.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Milliseconds since the task started running, if it has
    pub fn running_for_ms(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at.map(|started| (now - started).num_milliseconds())
    }
}

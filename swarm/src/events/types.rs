//! Event types for swarm activity streaming

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{HandoffStatus, MetricsSnapshot, RunSummary, TaskStatus};

/// Everything observable about a run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SwarmEvent {
    // === Tasks ===
    /// A task entered the queue
    TaskCreated {
        task_id: String,
        parent_id: Option<String>,
        description: String,
        priority: u32,
    },
    /// A task changed status
    TaskStatus {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A handoff arrived for a task
    TaskCompleted {
        task_id: String,
        status: HandoffStatus,
        summary: String,
        files_changed: usize,
    },
    /// A task is about to be handed to a sandbox
    Dispatching {
        task_id: String,
        branch: String,
        depth: u32,
    },

    // === Merging ===
    /// One merge attempt finished
    MergeResult {
        branch: String,
        success: bool,
        status: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        conflicts: Vec<String>,
    },

    // === Planning ===
    /// A planner round finished
    IterationComplete {
        iteration: u32,
        tasks_dispatched: usize,
        handoffs_received: usize,
        active: usize,
    },

    // === Health ===
    /// A reconciler sweep finished
    SweepResult {
        healthy: bool,
        build_ok: bool,
        tests_ok: bool,
        conflict_files: usize,
        fix_tasks: usize,
    },
    /// The reconciler produced fix tasks
    FixTasksCreated { task_ids: Vec<String> },

    // === Monitoring ===
    /// Periodic metrics snapshot
    Metrics(MetricsSnapshot),
    /// A running task exceeded the worker ceiling
    WorkerTimedOut { task_id: String, elapsed_ms: i64 },
    /// A completed handoff carried no diff
    EmptyDiff { task_id: String },
    /// A handoff looks like a misbehaving worker
    SuspiciousHandoff { task_id: String, reason: String },

    // === Lifecycle ===
    /// Final report, emitted on every shutdown path
    RunSummary(RunSummary),
    /// A component hit an error it could not handle locally
    Error { component: String, message: String },
}

impl SwarmEvent {
    /// Get the event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "TaskCreated",
            Self::TaskStatus { .. } => "TaskStatus",
            Self::TaskCompleted { .. } => "TaskCompleted",
            Self::Dispatching { .. } => "Dispatching",
            Self::MergeResult { .. } => "MergeResult",
            Self::IterationComplete { .. } => "IterationComplete",
            Self::SweepResult { .. } => "SweepResult",
            Self::FixTasksCreated { .. } => "FixTasksCreated",
            Self::Metrics(_) => "Metrics",
            Self::WorkerTimedOut { .. } => "WorkerTimedOut",
            Self::EmptyDiff { .. } => "EmptyDiff",
            Self::SuspiciousHandoff { .. } => "SuspiciousHandoff",
            Self::RunSummary(_) => "RunSummary",
            Self::Error { .. } => "Error",
        }
    }

    /// Task the event is about, if any
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskStatus { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::Dispatching { task_id, .. }
            | Self::WorkerTimedOut { task_id, .. }
            | Self::EmptyDiff { task_id }
            | Self::SuspiciousHandoff { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// A timestamped event as written to the event log
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: SwarmEvent,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: SwarmEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_task_id() {
        let event = SwarmEvent::TaskStatus {
            task_id: "task-1".to_string(),
            from: TaskStatus::Pending,
            to: TaskStatus::Assigned,
        };
        assert_eq!(event.event_type(), "TaskStatus");
        assert_eq!(event.task_id(), Some("task-1"));

        let event = SwarmEvent::FixTasksCreated { task_ids: vec![] };
        assert_eq!(event.task_id(), None);
    }

    #[test]
    fn test_tagged_serialization() {
        let entry = EventLogEntry::new(SwarmEvent::WorkerTimedOut {
            task_id: "task-9".to_string(),
            elapsed_ms: 1_900_000,
        });

        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("ts").is_some());
        assert_eq!(json["event"]["type"], "WorkerTimedOut");
        assert_eq!(json["event"]["task_id"], "task-9");
    }

    #[test]
    fn test_newtype_variant_carries_snapshot() {
        let event = SwarmEvent::Metrics(MetricsSnapshot {
            completed_tasks: 4,
            ..Default::default()
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Metrics");
        assert_eq!(json["completedTasks"], 4);
    }
}

//! Handoff - a worker's terminal report for one task

use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// Outcome reported by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Complete,
    Partial,
    Blocked,
    Failed,
}

impl HandoffStatus {
    /// Terminal task status for a handoff with this outcome
    ///
    /// Partial work still landed on the branch, so the task completes.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Complete | Self::Partial => TaskStatus::Complete,
            Self::Blocked | Self::Failed => TaskStatus::Failed,
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Work metrics reported alongside a handoff
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandoffMetrics {
    pub lines_added: u64,
    pub lines_removed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_used: u64,
    pub tool_call_count: u64,
    pub duration_ms: u64,
}

/// A worker's report of task outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handoff {
    #[serde(default)]
    pub task_id: String,
    pub status: HandoffStatus,
    #[serde(default)]
    pub summary: String,
    /// Unified diff text, may be empty
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub metrics: HandoffMetrics,
}

impl Handoff {
    /// Synthesize a failed handoff for a dispatch that never produced one
    pub fn failed(task_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            task_id: task_id.into(),
            status: HandoffStatus::Failed,
            summary: format!("Dispatch failed: {}", reason),
            diff: String::new(),
            files_changed: Vec::new(),
            concerns: vec![reason],
            suggestions: vec!["Retry the task".to_string()],
            metrics: HandoffMetrics::default(),
        }
    }

    /// Completed without touching any file
    pub fn is_empty_diff(&self) -> bool {
        self.diff.trim().is_empty() && self.files_changed.is_empty()
    }
}

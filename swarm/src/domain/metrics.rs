//! Run-level aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of the run, recomputed on demand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub active_workers: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Completed tasks per elapsed hour
    pub commits_per_hour: f64,
    /// Merge successes over attempts, 0 without attempts
    pub merge_success_rate: f64,
    pub total_tokens_used: u64,
    pub total_cost_usd: f64,
}

/// Merge queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeStats {
    pub attempts: u64,
    pub merged: u64,
    pub conflicts: u64,
    pub failed: u64,
    /// Conflicted branches re-queued after a rebase
    pub retries: u64,
    /// Branches handed to the conflict handler
    pub escalated: u64,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Planning finished and finalization ran
    Completed,
    /// A fatal error stopped planning or finalization
    Aborted,
    /// Shutdown was requested from outside
    Interrupted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Emitted once on every shutdown path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metrics: MetricsSnapshot,
    pub merges: MergeStats,
    pub planner_iterations: u32,
    /// Finalization sweeps actually run
    pub sweeps: u32,
    /// Whether the last sweep was green
    pub healthy: Option<bool>,
    pub elapsed_ms: u64,
}

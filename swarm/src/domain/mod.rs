//! Domain types for AgentSwarm
//!
//! Core domain types: Task, Handoff, run metrics and ID/branch helpers.
//! Nothing here is persisted; tasks live for the duration of one run.

mod handoff;
mod id;
mod metrics;
mod task;

pub use handoff::{Handoff, HandoffMetrics, HandoffStatus};
pub use id::{branch_name, generate_id, generate_task_id, slugify};
pub use metrics::{MergeStats, MetricsSnapshot, RunOutcome, RunSummary};
pub use task::{DEFAULT_PRIORITY, FIX_PRIORITY, MAX_FIX_TASKS, Task, TaskStatus};

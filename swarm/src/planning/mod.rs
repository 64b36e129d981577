//! Planning
//!
//! The root planner conversation, recursive subplanners, and the pieces they
//! share: response parsing, history management, and repository snapshots.

mod conversation;
mod parse;
mod planner;
mod snapshot;
mod subplanner;

pub use conversation::{
    Backoff, CONTINUE_PROMPT, CallSettings, CompactedStats, CompletedText, Conversation, complete_text,
    render_handoffs, render_scratchpad,
};
pub use parse::{
    ParseError, PlanResponse, RawTask, ResponseFormat, parse_bare_array, parse_plan_response, parse_structured,
    salvage_scratchpad, salvage_tasks, strip_code_fences,
};
pub use planner::{Planner, PlannerReport, should_replan};
pub use snapshot::{FEATURE_MANIFESTS, RepoSnapshot};
pub use subplanner::{Subplanner, aggregate_handoffs, should_decompose, strip_scope};

//! Embedded prompts
//!
//! Compiled into the binary from `swarm/prompts/*.md`.

use tracing::debug;

/// Top-level planner system prompt
pub const PLANNER: &str = include_str!("../../prompts/planner.md");

/// Recursive decomposition system prompt
pub const SUBPLANNER: &str = include_str!("../../prompts/subplanner.md");

/// System prompt handed to each worker sandbox
pub const WORKER: &str = include_str!("../../prompts/worker.md");

/// Fix-planning prompt used by health sweeps
pub const RECONCILER: &str = include_str!("../../prompts/reconciler.md");

/// Names of every embedded prompt
pub const NAMES: [&str; 4] = ["planner", "subplanner", "worker", "reconciler"];

/// Get the embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "planner" => Some(PLANNER),
        "subplanner" => Some(SUBPLANNER),
        "worker" => Some(WORKER),
        "reconciler" => Some(RECONCILER),
        _ => {
            debug!("get_embedded: no match found");
            None
        }
    }
}

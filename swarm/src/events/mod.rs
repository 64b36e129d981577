//! Swarm event streaming
//!
//! A broadcast bus carrying `SwarmEvent`s plus an optional JSONL event log.

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus};
pub use logger::{EventLogger, read_events, spawn_event_logger};
pub use types::{EventLogEntry, SwarmEvent};

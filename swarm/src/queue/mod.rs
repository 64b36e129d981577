//! Task queue
//!
//! Holds every task created during a run and the priority-ordered pool of
//! pending tasks awaiting dispatch.

mod error;
mod pending;
mod task_queue;

pub use error::TaskQueueError;
pub use task_queue::{TaskObserver, TaskQueue};

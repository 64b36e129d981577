//! Worker dispatch
//!
//! Every task runs in its own ephemeral sandbox. The pool launches sandboxes;
//! the dispatcher bounds how many run at once and settles each task from its
//! handoff.

mod dispatch;
mod error;
mod http;
mod pool;
mod sandbox;
mod subprocess;

#[cfg(test)]
pub(crate) use dispatch::testing as dispatch_testing;
pub use dispatch::{SUBPLANNER_WORKER_ID, TaskDispatcher};
pub use error::WorkerError;
pub use http::{HttpSandbox, SandboxHealth};
#[cfg(test)]
pub(crate) use pool::testing;
pub use pool::WorkerPool;
pub use sandbox::{ASSIGNMENT_TYPE, AssignmentLlmConfig, Sandbox, TaskAssignment, parse_handoff};
pub use subprocess::SubprocessSandbox;
pub(crate) use subprocess::tail;

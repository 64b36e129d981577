//! Worker dispatch errors

use std::time::Duration;
use thiserror::Error;

/// Errors raised while dispatching a task to a sandbox
///
/// The pool never turns these into handoffs itself; callers synthesize a
/// failed handoff from them.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn sandbox: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Sandbox timed out after {0:?}")]
    Timeout(Duration),

    #[error("Sandbox exited with code {code:?}: {stderr}")]
    ExitStatus { code: Option<i32>, stderr: String },

    #[error("Sandbox transport error: {0}")]
    Transport(String),

    #[error("Malformed handoff: {0}")]
    MalformedHandoff(String),
}

impl From<reqwest::Error> for WorkerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

//! Sandbox launched as a local child process

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::error::WorkerError;
use super::sandbox::{Sandbox, TaskAssignment, parse_handoff};
use crate::domain::Handoff;

/// Characters of stderr kept in exit errors
const STDERR_TAIL_CHARS: usize = 2_000;

/// Runs a configured command once per task
///
/// The assignment JSON is passed as the final argument; the last non-empty
/// line the command prints on stdout must be the handoff JSON. The child is
/// killed if it outlives the timeout.
pub struct SubprocessSandbox {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl SubprocessSandbox {
    /// Build from a `[program, args...]` command line
    pub fn new(command: &[String]) -> Result<Self, WorkerError> {
        debug!(?command, "SubprocessSandbox::new: called");
        let (program, args) = command.split_first().ok_or_else(|| {
            WorkerError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty sandbox command",
            ))
        })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Last `max_chars` characters of `text`
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}

#[async_trait]
impl Sandbox for SubprocessSandbox {
    fn kind(&self) -> &'static str {
        "subprocess"
    }

    async fn run(&self, assignment: &TaskAssignment, timeout: Duration) -> Result<Handoff, WorkerError> {
        let task_id = &assignment.task.id;
        debug!(%task_id, program = %self.program, "SubprocessSandbox::run: called");
        let payload =
            serde_json::to_string(assignment).map_err(|e| WorkerError::Transport(format!("encode assignment: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(payload)
            .env("SWARM_TASK_ID", task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(WorkerError::Spawn)?;
        // Dropping the future on timeout drops the child, which kills it
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(WorkerError::Transport(e.to_string())),
            Err(_) => {
                warn!(%task_id, timeout_secs = timeout.as_secs(), "Sandbox process timed out, killed");
                return Err(WorkerError::Timeout(timeout));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(%task_id, code = ?output.status.code(), "SubprocessSandbox::run: non-zero exit");
            return Err(WorkerError::ExitStatus {
                code: output.status.code(),
                stderr: tail(stderr.trim(), STDERR_TAIL_CHARS),
            });
        }

        let last_line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| WorkerError::MalformedHandoff("sandbox produced no output".to_string()))?;

        parse_handoff(last_line)
    }
}

//! Git subprocess access

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// Serializes every working-tree mutation across components
pub type GitLock = Arc<Mutex<()>>;

pub fn new_git_lock() -> GitLock {
    Arc::new(Mutex::new(()))
}

/// Git invocation errors
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {args} failed: {stderr}")]
    Failed { args: String, stderr: String },
}

/// Captured result of one git invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(1),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// stdout and stderr together, for matching on git's messages
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr.trim_end()),
            (false, true) => self.stdout.trim_end().to_string(),
            _ => self.stderr.trim_end().to_string(),
        }
    }

    /// Git reported a content conflict
    pub fn is_conflict(&self) -> bool {
        let text = self.combined();
        text.contains("CONFLICT") || text.contains("could not apply")
    }

    /// Non-empty trimmed stdout lines
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Runs git commands against one working tree
///
/// A non-zero exit is reported through `GitOutput::success`, not as an error;
/// only failing to run git at all is an error.
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError>;

    /// Run and turn a non-zero exit into `GitError::Failed`
    async fn run_ok(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = self.run(args).await?;
        if output.success {
            Ok(output)
        } else {
            Err(GitError::Failed {
                args: args.join(" "),
                stderr: output.combined(),
            })
        }
    }
}

/// The real `git` binary
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }
}

#[async_trait]
impl GitRunner for GitCli {
    async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        debug!(?args, repo = ?self.repo, "GitCli::run: called");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .map_err(GitError::Spawn)?;

        let result = GitOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if !result.success {
            debug!(?args, code = ?result.code, stderr = %result.stderr.trim(), "GitCli::run: git exited non-zero");
        }
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Answers git commands by argument prefix, recording every call
    ///
    /// Rules are matched in insertion order; unmatched commands succeed with
    /// empty output.
    #[derive(Default)]
    pub struct ScriptedGit {
        rules: StdMutex<Vec<(Vec<String>, GitOutput)>>,
        calls: StdMutex<Vec<String>>,
    }

    impl ScriptedGit {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, prefix: &[&str], output: GitOutput) -> Self {
            self.rules
                .lock()
                .unwrap()
                .push((prefix.iter().map(|s| s.to_string()).collect(), output));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn called(&self, command: &str) -> bool {
            self.calls().iter().any(|c| c == command)
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    #[async_trait]
    impl GitRunner for ScriptedGit {
        async fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
            self.calls.lock().unwrap().push(args.join(" "));
            let rules = self.rules.lock().unwrap();
            let found = rules
                .iter()
                .find(|(prefix, _)| prefix.len() <= args.len() && prefix.iter().zip(args).all(|(p, a)| p == a))
                .map(|(_, output)| output.clone());
            Ok(found.unwrap_or_else(|| GitOutput::ok("")))
        }
    }
}

//! Health checks: conflict-marker scan and build/test commands

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use grep_matcher::Matcher;
use grep_regex::RegexMatcherBuilder;
use grep_searcher::sinks::UTF8;
use grep_searcher::{BinaryDetection, SearcherBuilder};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::worker::tail;

/// Start of an unresolved conflict block
const CONFLICT_MARKER_PATTERN: &str = r"^<{7}( |$)";

/// Whether a line opens a conflict block (`<<<<<<< ours`)
pub fn is_conflict_marker(line: &str) -> bool {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.strip_prefix("<<<<<<<") {
        Some(rest) => rest.is_empty() || rest.starts_with(' '),
        None => false,
    }
}

/// A conflict marker found in a tracked file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictMarker {
    pub file: String,
    pub line: u64,
}

/// Scan the given repository-relative files for conflict markers
///
/// Blocking; run it on the blocking pool. Unreadable and binary files are
/// skipped.
pub fn scan_conflict_markers(repo: &Path, files: &[String]) -> Vec<ConflictMarker> {
    debug!(files = files.len(), "scan_conflict_markers: called");
    let matcher = match RegexMatcherBuilder::new()
        .multi_line(true)
        .line_terminator(Some(b'\n'))
        .build(CONFLICT_MARKER_PATTERN)
    {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "Conflict marker pattern rejected");
            return Vec::new();
        }
    };
    let mut searcher = SearcherBuilder::new()
        .binary_detection(BinaryDetection::quit(b'\x00'))
        .line_number(true)
        .build();

    let mut markers = Vec::new();
    for file in files {
        let path: PathBuf = repo.join(file);
        if !path.is_file() {
            continue;
        }
        let result = searcher.search_path(
            &matcher,
            &path,
            UTF8(|line_num, line| {
                if matcher.is_match(line.as_bytes()).unwrap_or(false) && is_conflict_marker(line) {
                    markers.push(ConflictMarker {
                        file: file.clone(),
                        line: line_num,
                    });
                }
                Ok(true)
            }),
        );
        if let Err(e) = result {
            debug!(%file, error = %e, "scan_conflict_markers: skipping file");
        }
    }
    markers
}

/// Files containing at least one marker, in scan order
pub fn conflicted_files(markers: &[ConflictMarker]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    for marker in markers {
        if !files.contains(&marker.file) {
            files.push(marker.file.clone());
        }
    }
    files
}

/// Result of one build or test command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub command: Option<String>,
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Tail of combined stdout and stderr
    pub output: String,
}

impl CheckOutcome {
    /// An unconfigured check counts as passing
    pub fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            command: None,
            ok: true,
            exit_code: None,
            timed_out: false,
            output: String::new(),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.command.is_none()
    }

    /// Markdown section for the fix prompt
    pub fn render(&self) -> String {
        let command = self.command.as_deref().unwrap_or("(not configured)");
        let status = if self.is_skipped() {
            "skipped".to_string()
        } else if self.timed_out {
            "timed out".to_string()
        } else if self.ok {
            "passed".to_string()
        } else {
            match self.exit_code {
                Some(code) => format!("failed (exit {})", code),
                None => "failed (killed)".to_string(),
            }
        };
        let mut out = format!("## {}: {}\n\nCommand: `{}`\n", self.name, status, command);
        if !self.ok && !self.output.trim().is_empty() {
            out.push_str(&format!("\n```\n{}\n```\n", self.output.trim_end()));
        }
        out
    }
}

/// Run `command` through `sh -c` in `repo`, killing it after `timeout`
pub async fn run_check(name: &str, command: Option<&str>, repo: &Path, timeout: Duration, max_chars: usize) -> CheckOutcome {
    let Some(command) = command.map(str::trim).filter(|c| !c.is_empty()) else {
        debug!(%name, "run_check: no command configured");
        return CheckOutcome::skipped(name);
    };
    debug!(%name, %command, "run_check: called");

    let failed = |output: String, exit_code: Option<i32>, timed_out: bool| CheckOutcome {
        name: name.to_string(),
        command: Some(command.to_string()),
        ok: false,
        exit_code,
        timed_out,
        output,
    };

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(repo)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return failed(format!("failed to start: {}", e), None, false),
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return failed(format!("failed to wait: {}", e), None, false),
        Err(_) => {
            warn!(%name, timeout_secs = timeout.as_secs(), "Check timed out, killed");
            return failed(format!("timed out after {:?}", timeout), None, true);
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }

    CheckOutcome {
        name: name.to_string(),
        command: Some(command.to_string()),
        ok: output.status.success(),
        exit_code: output.status.code(),
        timed_out: false,
        output: tail(&combined, max_chars),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_is_conflict_marker() {
        assert!(is_conflict_marker("<<<<<<< HEAD"));
        assert!(is_conflict_marker("<<<<<<<"));
        assert!(is_conflict_marker("<<<<<<<\n"));
        assert!(!is_conflict_marker("<<<<<<<< eight"));
        assert!(!is_conflict_marker("  <<<<<<< indented"));
        assert!(!is_conflict_marker("a <<<<<<< b"));
    }

    #[test]
    fn test_scan_finds_markers_in_listed_files_only() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("clean.rs"), "fn main() {}\n").unwrap();
        std::fs::write(
            temp.path().join("broken.rs"),
            "fn a() {}\n<<<<<<< HEAD\nours\n=======\ntheirs\n>>>>>>> worker/t1\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("untracked.rs"), "<<<<<<< HEAD\n").unwrap();

        let files = vec!["clean.rs".to_string(), "broken.rs".to_string(), "gone.rs".to_string()];
        let markers = scan_conflict_markers(temp.path(), &files);

        assert_eq!(
            markers,
            vec![ConflictMarker {
                file: "broken.rs".to_string(),
                line: 2
            }]
        );
        assert_eq!(conflicted_files(&markers), vec!["broken.rs"]);
    }

    #[tokio::test]
    async fn test_run_check_outcomes() {
        let temp = tempdir().unwrap();
        let timeout = Duration::from_secs(10);

        let ok = run_check("build", Some("true"), temp.path(), timeout, 100).await;
        assert!(ok.ok);
        assert_eq!(ok.exit_code, Some(0));

        let failed = run_check("tests", Some("echo out; echo boom >&2; exit 3"), temp.path(), timeout, 100).await;
        assert!(!failed.ok);
        assert_eq!(failed.exit_code, Some(3));
        assert!(failed.output.contains("out"));
        assert!(failed.output.contains("boom"));
        assert!(failed.render().contains("failed (exit 3)"));

        let skipped = run_check("tests", None, temp.path(), timeout, 100).await;
        assert!(skipped.ok);
        assert!(skipped.is_skipped());
    }

    #[tokio::test]
    async fn test_run_check_times_out() {
        let temp = tempdir().unwrap();
        let outcome = run_check("tests", Some("sleep 5"), temp.path(), Duration::from_millis(100), 100).await;
        assert!(!outcome.ok);
        assert!(outcome.timed_out);
    }
}

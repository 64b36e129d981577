//! Repository snapshot handed to planning models

use std::path::Path;

use tracing::debug;

use crate::merge::GitRunner;

/// Feature manifest names looked up at the repository root
pub const FEATURE_MANIFESTS: [&str; 2] = ["FEATURES.json", "features.json"];

const RECENT_COMMITS: usize = 15;

/// What a planner sees of the repository at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub files: Vec<String>,
    /// Tracked files left out because of the cap
    pub omitted_files: usize,
    pub recent_commits: Vec<String>,
    pub features: Option<String>,
}

impl RepoSnapshot {
    /// Read the tracked file tree, recent commits and the feature manifest
    ///
    /// Failures degrade to an empty section; a snapshot never fails.
    pub async fn capture(git: &dyn GitRunner, repo: &Path, max_files: usize) -> Self {
        debug!(?repo, max_files, "RepoSnapshot::capture: called");
        let mut files = match git.run(&["ls-files"]).await {
            Ok(output) if output.success => output.lines(),
            Ok(output) => {
                debug!(stderr = %output.stderr.trim(), "RepoSnapshot::capture: ls-files failed");
                Vec::new()
            }
            Err(e) => {
                debug!(error = %e, "RepoSnapshot::capture: git unavailable");
                Vec::new()
            }
        };
        let omitted_files = files.len().saturating_sub(max_files);
        files.truncate(max_files);

        let count = RECENT_COMMITS.to_string();
        let recent_commits = match git.run(&["log", "--oneline", "-n", &count]).await {
            Ok(output) if output.success => output.lines(),
            _ => Vec::new(),
        };

        let mut features = None;
        for name in FEATURE_MANIFESTS {
            if let Ok(content) = tokio::fs::read_to_string(repo.join(name)).await {
                features = Some(content);
                break;
            }
        }

        Self {
            files,
            omitted_files,
            recent_commits,
            features,
        }
    }

    /// Markdown rendering for a prompt
    pub fn render(&self) -> String {
        let mut out = String::from("## Repository\n\n### Files\n\n");
        if self.files.is_empty() {
            out.push_str("(no tracked files yet)\n");
        }
        for file in &self.files {
            out.push_str(&format!("- {}\n", file));
        }
        if self.omitted_files > 0 {
            out.push_str(&format!("- ... and {} more\n", self.omitted_files));
        }

        out.push_str("\n### Recent commits\n\n");
        if self.recent_commits.is_empty() {
            out.push_str("(none)\n");
        }
        for commit in &self.recent_commits {
            out.push_str(&format!("- {}\n", commit));
        }

        if let Some(features) = &self.features {
            out.push_str("\n### Feature manifest\n\n```json\n");
            out.push_str(features.trim_end());
            out.push_str("\n```\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::GitOutput;
    use crate::merge::testing::ScriptedGit;

    #[tokio::test]
    async fn test_capture_caps_files() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("features.json"), "{\"auth\": \"done\"}\n").unwrap();
        let git = ScriptedGit::new()
            .on(&["ls-files"], GitOutput::ok("a.rs\nb.rs\nc.rs\n"))
            .on(&["log"], GitOutput::ok("abc123 initial\n"));

        let snapshot = RepoSnapshot::capture(&git, temp.path(), 2).await;
        assert_eq!(snapshot.files, vec!["a.rs", "b.rs"]);
        assert_eq!(snapshot.omitted_files, 1);
        assert_eq!(snapshot.recent_commits, vec!["abc123 initial"]);

        let rendered = snapshot.render();
        assert!(rendered.contains("- a.rs"));
        assert!(rendered.contains("... and 1 more"));
        assert!(rendered.contains("\"auth\""));
    }

    #[tokio::test]
    async fn test_capture_without_git_history() {
        let temp = tempfile::tempdir().unwrap();
        let git = ScriptedGit::new()
            .on(&["ls-files"], GitOutput::failed("", "fatal: not a git repository"))
            .on(&["log"], GitOutput::failed("", "fatal: not a git repository"));

        let snapshot = RepoSnapshot::capture(&git, temp.path(), 10).await;
        assert_eq!(snapshot, RepoSnapshot::default());
        assert!(snapshot.render().contains("(no tracked files yet)"));
    }
}

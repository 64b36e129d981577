//! Reconciler - keeps main green by delegating fixes

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::checks::{CheckOutcome, conflicted_files, run_check, scan_conflict_markers};
use crate::config::Config;
use crate::domain::{FIX_PRIORITY, MAX_FIX_TASKS, Task, generate_id};
use crate::events::{EventBus, SwarmEvent};
use crate::llm::{LlmClient, Message};
use crate::merge::{GitLock, GitRunner};
use crate::monitor::Monitor;
use crate::planning::{CallSettings, complete_text, parse_plan_response};
use crate::prompts::{PromptContext, PromptLoader};

/// Receives fix tasks produced by periodic sweeps
pub type FixTaskHandler = Arc<dyn Fn(&[Task]) + Send + Sync>;

/// Commits of history sent along with a failure
const RECENT_COMMITS: &str = "10";

/// What one sweep found
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub healthy: bool,
    pub build: CheckOutcome,
    pub tests: CheckOutcome,
    pub conflict_files: Vec<String>,
    pub fix_tasks: Vec<Task>,
}

/// Periodic build, test, and conflict-marker health check
///
/// Never edits code. When something is broken it asks the fix model for a
/// short list of `fix-` tasks at priority 1 and hands them on.
pub struct Reconciler {
    llm: Arc<dyn LlmClient>,
    git: Arc<dyn GitRunner>,
    git_lock: GitLock,
    repo_path: PathBuf,
    system_prompt: String,
    build_command: Option<String>,
    test_command: Option<String>,
    command_timeout: Duration,
    max_output_chars: usize,
    max_fix_tasks: usize,
    interval: Duration,
    settings: CallSettings,
    branch_prefix: String,
    events: Arc<EventBus>,
    monitor: Option<Arc<Monitor>>,
    fix_handlers: RwLock<Vec<FixTaskHandler>>,
    sweeps: AtomicU64,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Reconciler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        git: Arc<dyn GitRunner>,
        git_lock: GitLock,
        prompts: &PromptLoader,
        config: &Config,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let reconciler = &config.reconciler;
        debug!(
            build = ?reconciler.build_command,
            tests = ?reconciler.test_command,
            interval_secs = reconciler.interval_secs,
            "Reconciler::new: called"
        );
        let system_prompt = prompts
            .render("reconciler", &PromptContext::from_config(config))
            .context("Failed to render reconciler prompt")?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            llm,
            git,
            git_lock,
            repo_path: config.target.repo_path.clone(),
            system_prompt,
            build_command: reconciler.build_command.clone(),
            test_command: reconciler.test_command.clone(),
            command_timeout: Duration::from_secs(reconciler.command_timeout_secs.max(1)),
            max_output_chars: reconciler.max_output_chars,
            max_fix_tasks: reconciler.max_fix_tasks.clamp(1, MAX_FIX_TASKS),
            interval: Duration::from_secs(reconciler.interval_secs.max(1)),
            settings: CallSettings {
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
                max_continuations: config.planner.max_continuations,
            },
            branch_prefix: config.git.branch_prefix.clone(),
            events,
            monitor: None,
            fix_handlers: RwLock::new(Vec::new()),
            sweeps: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
        })
    }

    /// Record fix-model token usage with this monitor
    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Register a handler for fix tasks found by the background loop
    pub fn on_fix_tasks(&self, handler: FixTaskHandler) {
        self.fix_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Sweeps completed so far
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Run one health check and, if unhealthy, plan fixes
    pub async fn sweep(&self) -> Result<SweepReport> {
        debug!(sweep = self.sweeps() + 1, "Reconciler::sweep: called");

        let (conflict_files, build, tests, recent_commits) = {
            let _guard = self.git_lock.lock().await;
            let conflict_files = self.find_conflicts().await?;
            let build = run_check(
                "Build",
                self.build_command.as_deref(),
                &self.repo_path,
                self.command_timeout,
                self.max_output_chars,
            )
            .await;
            let tests = run_check(
                "Tests",
                self.test_command.as_deref(),
                &self.repo_path,
                self.command_timeout,
                self.max_output_chars,
            )
            .await;
            let healthy = build.ok && tests.ok && conflict_files.is_empty();
            let recent_commits = if healthy { String::new() } else { self.recent_commits().await };
            (conflict_files, build, tests, recent_commits)
        };

        let healthy = build.ok && tests.ok && conflict_files.is_empty();
        let fix_tasks = if healthy {
            Vec::new()
        } else {
            warn!(
                build_ok = build.ok,
                tests_ok = tests.ok,
                conflict_files = conflict_files.len(),
                "Main is unhealthy, planning fixes"
            );
            let message = render_failure(&build, &tests, &conflict_files, &recent_commits);
            self.plan_fixes(&message).await?
        };

        self.sweeps.fetch_add(1, Ordering::SeqCst);
        info!(healthy, fix_tasks = fix_tasks.len(), "Sweep complete");
        self.events.emit(SwarmEvent::SweepResult {
            healthy,
            build_ok: build.ok,
            tests_ok: tests.ok,
            conflict_files: conflict_files.len(),
            fix_tasks: fix_tasks.len(),
        });
        if !fix_tasks.is_empty() {
            self.events.emit(SwarmEvent::FixTasksCreated {
                task_ids: fix_tasks.iter().map(|t| t.id.clone()).collect(),
            });
        }

        Ok(SweepReport {
            healthy,
            build,
            tests,
            conflict_files,
            fix_tasks,
        })
    }

    async fn find_conflicts(&self) -> Result<Vec<String>> {
        let listed = self
            .git
            .run_ok(&["ls-files"])
            .await
            .context("Failed to list tracked files")?;
        let files = listed.lines();
        let repo = self.repo_path.clone();
        let markers = tokio::task::spawn_blocking(move || scan_conflict_markers(&repo, &files))
            .await
            .context("Conflict scan panicked")?;
        Ok(conflicted_files(&markers))
    }

    async fn recent_commits(&self) -> String {
        match self.git.run(&["log", "--oneline", "-n", RECENT_COMMITS]).await {
            Ok(output) if output.success && !output.stdout.trim().is_empty() => output.stdout.trim().to_string(),
            Ok(_) => "(no commits)".to_string(),
            Err(e) => {
                debug!(error = %e, "Reconciler::recent_commits: git log failed");
                "(unavailable)".to_string()
            }
        }
    }

    async fn plan_fixes(&self, message: &str) -> Result<Vec<Task>> {
        debug!("Reconciler::plan_fixes: called");
        let completed = complete_text(
            self.llm.as_ref(),
            &self.system_prompt,
            vec![Message::user(message)],
            &self.settings,
        )
        .await
        .context("Fix planning model call failed")?;
        if let Some(monitor) = &self.monitor {
            monitor.record_usage(&completed.usage);
        }

        let response = parse_plan_response(&completed.text).context("Fix planning response could not be parsed")?;
        let tasks: Vec<Task> = response
            .tasks
            .into_iter()
            .filter(|raw| !raw.description.trim().is_empty())
            .take(self.max_fix_tasks)
            .map(|raw| {
                raw.into_task(generate_id("fix"), &self.branch_prefix)
                    .with_priority(FIX_PRIORITY)
            })
            .collect();
        info!(count = tasks.len(), "Fix tasks planned");
        Ok(tasks)
    }

    /// Start periodic sweeps, handing fix tasks to the registered handlers
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        debug!(interval_secs = self.interval.as_secs(), "Reconciler::start: called");
        self.running.store(true, Ordering::SeqCst);
        let reconciler = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconciler.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reconciler.periodic_sweep().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Reconciler: sweep loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn periodic_sweep(&self) {
        match self.sweep().await {
            Ok(report) if !report.fix_tasks.is_empty() => {
                let handlers: Vec<FixTaskHandler> = self
                    .fix_handlers
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for handler in handlers {
                    handler(&report.fix_tasks);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Periodic sweep failed");
                self.events.emit_error("reconciler", format!("{:#}", e));
            }
        }
    }

    pub fn stop(&self) {
        debug!("Reconciler::stop: called");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// The user message sent to the fix model
pub fn render_failure(build: &CheckOutcome, tests: &CheckOutcome, conflict_files: &[String], recent_commits: &str) -> String {
    let mut out = String::new();
    if !conflict_files.is_empty() {
        out.push_str("## Unresolved conflict markers\n\n");
        for file in conflict_files {
            out.push_str(&format!("- {}\n", file));
        }
        out.push('\n');
    }
    out.push_str(&build.render());
    out.push('\n');
    out.push_str(&tests.render());
    out.push_str(&format!("\n## Recent commits\n\n```\n{}\n```\n", recent_commits));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::MockLlmClient;
    use crate::merge::{GitCli, new_git_lock};
    use std::path::Path;
    use std::process::Command as StdCommand;
    use tempfile::{TempDir, tempdir};

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn repo_with(files: &[(&str, &str)]) -> TempDir {
        let temp = tempdir().unwrap();
        git(temp.path(), &["init", "-q", "-b", "main"]);
        for (name, content) in files {
            std::fs::write(temp.path().join(name), content).unwrap();
        }
        git(temp.path(), &["add", "."]);
        temp
    }

    fn reconciler(repo: &Path, build: &str, tests: &str, llm: Arc<MockLlmClient>) -> (Reconciler, Arc<EventBus>) {
        reconciler_with(repo, build, tests, llm, |_| {})
    }

    fn reconciler_with(
        repo: &Path,
        build: &str,
        tests: &str,
        llm: Arc<MockLlmClient>,
        configure: impl FnOnce(&mut Config),
    ) -> (Reconciler, Arc<EventBus>) {
        let mut config = Config::default();
        config.target.repo_path = repo.to_path_buf();
        config.reconciler.build_command = Some(build.to_string());
        config.reconciler.test_command = Some(tests.to_string());
        config.reconciler.command_timeout_secs = 30;
        configure(&mut config);
        let events = Arc::new(EventBus::new(64));
        let reconciler = Reconciler::new(
            llm,
            Arc::new(GitCli::new(repo)),
            new_git_lock(),
            &PromptLoader::embedded_only(),
            &config,
            events.clone(),
        )
        .unwrap();
        (reconciler, events)
    }

    #[tokio::test]
    async fn test_green_sweep_creates_no_fixes() {
        let repo = repo_with(&[("main.rs", "fn main() {}\n")]);
        let llm = Arc::new(MockLlmClient::new(vec![]));
        let (reconciler, events) = reconciler(repo.path(), "true", "true", llm.clone());
        let mut rx = events.subscribe();

        let report = reconciler.sweep().await.unwrap();

        assert!(report.healthy);
        assert!(report.fix_tasks.is_empty());
        assert!(report.conflict_files.is_empty());
        assert_eq!(llm.call_count(), 0);
        assert_eq!(reconciler.sweeps(), 1);
        match rx.try_recv().unwrap() {
            SwarmEvent::SweepResult { healthy, fix_tasks, .. } => {
                assert!(healthy);
                assert_eq!(fix_tasks, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_build_yields_capped_fix_tasks() {
        let repo = repo_with(&[("lib.rs", "pub fn f() {}\n")]);
        let tasks: Vec<String> = (1..=7)
            .map(|i| format!(r#"{{"description": "Fix error {}", "scope": ["lib.rs"], "priority": 9}}"#, i))
            .collect();
        let response = format!("[{}]", tasks.join(","));
        let llm = Arc::new(MockLlmClient::from_texts(&[&response]));
        let (reconciler, events) = reconciler(
            repo.path(),
            "echo 'error[E0425]: cannot find value `x`' >&2; exit 1",
            "true",
            llm.clone(),
        );
        let mut rx = events.subscribe();

        let report = reconciler.sweep().await.unwrap();

        assert!(!report.healthy);
        assert!(!report.build.ok);
        assert!(report.tests.ok);
        assert_eq!(report.fix_tasks.len(), 5);
        for task in &report.fix_tasks {
            assert!(task.id.starts_with("fix-"));
            assert_eq!(task.priority, FIX_PRIORITY);
        }

        let request = &llm.requests()[0];
        assert!(request.messages[0].content.contains("cannot find value"));
        assert!(request.messages[0].content.contains("(no commits)"));

        assert_eq!(rx.try_recv().unwrap().event_type(), "SweepResult");
        assert_eq!(rx.try_recv().unwrap().event_type(), "FixTasksCreated");
    }

    #[tokio::test]
    async fn test_fix_tasks_never_exceed_five_even_when_configured_higher() {
        let repo = repo_with(&[("lib.rs", "pub fn f() {}\n")]);
        let tasks: Vec<String> = (1..=8)
            .map(|i| format!(r#"{{"description": "Fix error {}", "scope": ["lib.rs"]}}"#, i))
            .collect();
        let response = format!("[{}]", tasks.join(","));
        let llm = Arc::new(MockLlmClient::from_texts(&[&response]));
        let (reconciler, _events) = reconciler_with(repo.path(), "exit 1", "true", llm, |config| {
            config.reconciler.max_fix_tasks = 8;
        });

        let report = reconciler.sweep().await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.fix_tasks.len(), MAX_FIX_TASKS);
    }

    #[tokio::test]
    async fn test_zero_fix_task_setting_still_yields_a_fix() {
        let repo = repo_with(&[("lib.rs", "pub fn f() {}\n")]);
        let llm = Arc::new(MockLlmClient::from_texts(&[
            r#"[{"description": "Fix the build", "scope": ["lib.rs"]}, {"description": "Fix again", "scope": ["lib.rs"]}]"#,
        ]));
        let (reconciler, _events) = reconciler_with(repo.path(), "exit 1", "true", llm, |config| {
            config.reconciler.max_fix_tasks = 0;
        });

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.fix_tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_markers_make_main_unhealthy() {
        let repo = repo_with(&[
            ("ok.rs", "fn ok() {}\n"),
            ("merged.rs", "<<<<<<< HEAD\na\n=======\nb\n>>>>>>> worker/t2\n"),
        ]);
        let llm = Arc::new(MockLlmClient::from_texts(&[
            r#"[{"description": "Resolve markers in merged.rs", "scope": ["merged.rs"]}]"#,
        ]));
        let (reconciler, _events) = reconciler(repo.path(), "true", "true", llm.clone());

        let report = reconciler.sweep().await.unwrap();

        assert!(!report.healthy);
        assert_eq!(report.conflict_files, vec!["merged.rs"]);
        assert_eq!(report.fix_tasks.len(), 1);
        assert_eq!(report.fix_tasks[0].scope, vec!["merged.rs"]);
        assert!(llm.requests()[0].messages[0].content.contains("- merged.rs"));
    }

    #[tokio::test]
    async fn test_unparseable_fix_response_is_an_error() {
        let repo = repo_with(&[("lib.rs", "")]);
        let llm = Arc::new(MockLlmClient::from_texts(&["I could not work out what broke"]));
        let (reconciler, _events) = reconciler(repo.path(), "false", "true", llm);

        let err = reconciler.sweep().await.unwrap_err();
        assert!(format!("{:#}", err).contains("could not be parsed"));
        assert_eq!(reconciler.sweeps(), 0);
    }

    #[tokio::test]
    async fn test_background_loop_stops() {
        let repo = repo_with(&[("lib.rs", "")]);
        let llm = Arc::new(MockLlmClient::new(vec![]));
        let (reconciler, _events) = reconciler(repo.path(), "true", "true", llm);
        let reconciler = Arc::new(reconciler);

        let handle = reconciler.start();
        assert!(reconciler.is_running());
        reconciler.stop();
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(!reconciler.is_running());
    }
}

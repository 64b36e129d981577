//! Planner - the top-level planning conversation for a run

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::conversation::{Backoff, CallSettings, Conversation, complete_text, render_handoffs, render_scratchpad};
use super::parse::{RawTask, parse_plan_response};
use super::snapshot::RepoSnapshot;
use super::subplanner::Subplanner;
use crate::config::{Config, PlannerConfig};
use crate::domain::{Handoff, Task, generate_task_id};
use crate::events::{EventBus, SwarmEvent};
use crate::llm::LlmClient;
use crate::merge::GitRunner;
use crate::prompts::{PromptContext, PromptLoader};
use crate::worker::TaskDispatcher;

/// Whether the planner should call the model this time around
///
/// Always on the first iteration; afterwards once enough handoffs have piled
/// up, or when nothing is running any more.
pub fn should_replan(iteration: u32, pending_handoffs: usize, min_handoffs: usize, active: usize) -> bool {
    iteration == 0 || pending_handoffs >= min_handoffs.max(1) || active == 0
}

/// What a finished planning loop did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlannerReport {
    pub iterations: u32,
    pub tasks_created: usize,
    pub handoffs: usize,
}

/// State carried between rounds of one run
struct LoopState {
    conversation: Conversation,
    scratchpad: Option<String>,
    pending: Vec<Handoff>,
    report: PlannerReport,
}

/// Drives one continuous conversation with the planning model
///
/// Each round sends the handoffs collected since the previous round plus a
/// fresh repository snapshot, and dispatches whatever tasks come back. The
/// loop ends when the model returns no tasks while nothing is running.
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<TaskDispatcher>,
    subplanner: Arc<Subplanner>,
    git: Arc<dyn GitRunner>,
    repo_path: PathBuf,
    system_prompt: String,
    config: PlannerConfig,
    settings: CallSettings,
    branch_prefix: String,
    events: Arc<EventBus>,
    backoff: Backoff,
    running: AtomicBool,
    iterations: AtomicU32,
    inbox_tx: mpsc::UnboundedSender<Task>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Task>>,
}

impl Planner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<TaskDispatcher>,
        subplanner: Arc<Subplanner>,
        git: Arc<dyn GitRunner>,
        prompts: &PromptLoader,
        config: &Config,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        debug!(repo = ?config.target.repo_path, "Planner::new: called");
        let system_prompt = prompts
            .render("planner", &PromptContext::from_config(config))
            .context("Failed to render planner prompt")?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Self {
            llm,
            dispatcher,
            subplanner,
            git,
            repo_path: config.target.repo_path.clone(),
            system_prompt,
            config: config.planner.clone(),
            settings: CallSettings {
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
                max_continuations: config.planner.max_continuations,
            },
            branch_prefix: config.git.branch_prefix.clone(),
            events,
            backoff: Backoff::default(),
            running: AtomicBool::new(true),
            iterations: AtomicU32::new(0),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        })
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Stop planning; dispatched tasks are allowed to finish
    pub fn stop(&self) {
        debug!("Planner::stop: called");
        self.running.store(false, Ordering::SeqCst);
        self.subplanner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Planning iterations completed so far
    pub fn iterations(&self) -> u32 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Hand a task (typically a fix) to the running loop for dispatch
    ///
    /// Returns false once `run_loop` has returned; nothing reads the inbox after that.
    pub fn inject(&self, task: Task) -> bool {
        debug!(task_id = %task.id, "Planner::inject: called");
        self.inbox_tx.send(task).is_ok()
    }

    /// Run planning rounds until the model has nothing left to do
    pub async fn run_loop(&self, request: &str) -> Result<PlannerReport> {
        info!(request_chars = request.len(), "Planner started");
        let mut inbox = self.inbox_rx.lock().await;
        let mut active: JoinSet<Handoff> = JoinSet::new();
        let mut state = LoopState {
            conversation: Conversation::new(self.config.history_char_budget, self.config.keep_recent_exchanges),
            scratchpad: None,
            pending: Vec::new(),
            report: PlannerReport::default(),
        };
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut failures = 0u32;

        let outcome: Result<()> = loop {
            if !self.is_running() {
                info!("Planner stopped");
                break Ok(());
            }

            while let Ok(task) = inbox.try_recv() {
                self.accept_injected(task);
            }
            self.dispatch_pending(&mut active);

            if should_replan(
                state.report.iterations,
                state.pending.len(),
                self.config.min_handoffs,
                active.len(),
            ) {
                if state.report.iterations >= self.config.max_iterations {
                    warn!(iterations = state.report.iterations, "Planner reached its iteration cap");
                    break Ok(());
                }

                match self.plan_round(request, &mut state, active.len()).await {
                    Ok(tasks) => {
                        failures = 0;
                        let handoffs_received = state.pending.len();
                        state.pending.clear();
                        state.report.iterations += 1;
                        self.iterations.store(state.report.iterations, Ordering::SeqCst);

                        let planned = tasks.len();
                        for task in tasks {
                            match self.dispatcher.submit(task) {
                                Ok(()) => state.report.tasks_created += 1,
                                Err(e) => warn!(error = %e, "Planned task rejected"),
                            }
                        }
                        self.dispatch_pending(&mut active);

                        info!(
                            iteration = state.report.iterations,
                            planned,
                            handoffs_received,
                            active = active.len(),
                            "Planning iteration complete"
                        );
                        self.events.emit(SwarmEvent::IterationComplete {
                            iteration: state.report.iterations,
                            tasks_dispatched: planned,
                            handoffs_received,
                            active: active.len(),
                        });

                        if planned == 0 && active.is_empty() {
                            info!(iterations = state.report.iterations, "Planner finished: no further tasks");
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        if failures >= self.config.max_consecutive_failures {
                            error!(failures, error = %e, "Planner giving up");
                            break Err(e.wrap_err(format!("Planner aborted after {} consecutive failures", failures)));
                        }
                        let delay = self.backoff.delay(failures);
                        warn!(failures, delay_ms = delay.as_millis() as u64, error = %e, "Planning round failed, backing off");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }

            tokio::select! {
                Some(joined) = active.join_next(), if !active.is_empty() => {
                    if let Some(handoff) = collect(joined) {
                        state.report.handoffs += 1;
                        state.pending.push(handoff);
                    }
                }
                Some(task) = inbox.recv() => {
                    self.accept_injected(task);
                }
                _ = tokio::time::sleep(poll) => {}
            }
        };

        inbox.close();
        while let Ok(task) = inbox.try_recv() {
            warn!(task_id = %task.id, "Planner finished, injected task dropped");
        }

        if !active.is_empty() {
            info!(active = active.len(), "Waiting for in-flight tasks");
        }
        while let Some(joined) = active.join_next().await {
            if collect(joined).is_some() {
                state.report.handoffs += 1;
            }
        }

        outcome.map(|()| state.report)
    }

    fn accept_injected(&self, task: Task) {
        let task_id = task.id.clone();
        match self.dispatcher.submit(task) {
            Ok(()) => info!(%task_id, "Injected task queued"),
            Err(e) => warn!(%task_id, error = %e, "Injected task rejected"),
        }
    }

    /// Start everything in the pending pool, most urgent first
    fn dispatch_pending(&self, active: &mut JoinSet<Handoff>) {
        while let Some(task) = self.dispatcher.queue().get_next_pending() {
            debug!(task_id = %task.id, priority = task.priority, "Planner::dispatch_pending: spawning");
            active.spawn(Arc::clone(&self.subplanner).execute(task, 0));
        }
    }

    async fn plan_round(&self, request: &str, state: &mut LoopState, active: usize) -> Result<Vec<Task>> {
        debug!(iteration = state.report.iterations, handoffs = state.pending.len(), "Planner::plan_round: called");
        let snapshot = RepoSnapshot::capture(self.git.as_ref(), &self.repo_path, self.config.max_snapshot_files).await;

        let message = if state.conversation.is_empty() {
            format!("## Request\n\n{}\n\n{}", request.trim(), snapshot.render())
        } else {
            format!(
                "## Handoffs since your last plan\n\n{}\n{}\n## In flight\n\n{} tasks are still running.\n\n{}",
                render_handoffs(&state.pending),
                render_scratchpad(state.scratchpad.as_deref()),
                active,
                snapshot.render()
            )
        };

        let messages = state.conversation.messages(&message);
        let completed = complete_text(self.llm.as_ref(), &self.system_prompt, messages, &self.settings)
            .await
            .context("Planning model call failed")?;
        self.dispatcher.monitor().record_usage(&completed.usage);

        let response = parse_plan_response(&completed.text).context("Planning response could not be parsed")?;
        if response.scratchpad.is_some() {
            state.scratchpad = response.scratchpad;
        }
        let tasks = self.build_tasks(response.tasks);
        state
            .conversation
            .record(message, completed.text, tasks.len(), state.pending.len());
        Ok(tasks)
    }

    /// Turn raw tasks into pending tasks, keeping model ids only when unused
    fn build_tasks(&self, raw: Vec<RawTask>) -> Vec<Task> {
        let mut seen: HashSet<String> = HashSet::new();
        raw.into_iter()
            .map(|raw| {
                let id = match raw.requested_id() {
                    Some(id) if !seen.contains(id) && self.dispatcher.queue().get(id).is_none() => id.to_string(),
                    _ => generate_task_id(),
                };
                seen.insert(id.clone());
                raw.into_task(id, &self.branch_prefix)
            })
            .collect()
    }
}

fn collect(joined: std::result::Result<Handoff, tokio::task::JoinError>) -> Option<Handoff> {
    match joined {
        Ok(handoff) => Some(handoff),
        Err(e) => {
            error!(error = %e, "Dispatch task panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FIX_PRIORITY, HandoffStatus, TaskStatus};
    use crate::llm::client::mock::{FnLlmClient, text_response};
    use crate::llm::{CompletionRequest, CompletionResponse, LlmError};
    use crate::merge::testing::ScriptedGit;
    use crate::worker::dispatch_testing::{Harness, harness, quick_sandbox};

    fn planner_config() -> Config {
        let mut config = Config::default();
        config.planner.poll_interval_ms = 5;
        config.planner.max_consecutive_failures = 3;
        config
    }

    fn planner<F>(h: &Harness, config: &Config, respond: F) -> Planner
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync + 'static,
    {
        let llm: Arc<dyn LlmClient> = Arc::new(FnLlmClient::new(respond));
        let prompts = PromptLoader::embedded_only();
        let backoff = Backoff {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        };
        let subplanner = Arc::new(
            Subplanner::new(llm.clone(), h.dispatcher.clone(), Arc::new(PromptLoader::embedded_only()), config)
                .with_backoff(backoff),
        );
        Planner::new(
            llm,
            h.dispatcher.clone(),
            subplanner,
            Arc::new(ScriptedGit::new()),
            &prompts,
            config,
            h.events.clone(),
        )
        .unwrap()
        .with_backoff(backoff)
    }

    fn last_user_message(request: &CompletionRequest) -> String {
        request.messages.last().map(|m| m.content.clone()).unwrap_or_default()
    }

    #[test]
    fn test_should_replan() {
        assert!(should_replan(0, 0, 3, 5));
        assert!(!should_replan(1, 2, 3, 5));
        assert!(should_replan(1, 3, 3, 5));
        assert!(should_replan(4, 0, 3, 0));
    }

    #[tokio::test]
    async fn test_plans_until_model_returns_no_tasks() {
        let h = harness(quick_sandbox(), 2);
        let config = planner_config();
        let p = planner(&h, &config, |request| {
            let text = if request.messages.len() == 1 {
                assert!(last_user_message(request).contains("Build a todo app"));
                r#"{"scratchpad": "two tasks out", "tasks": [
                    {"id": "api", "description": "Write the API", "scope": ["api.rs"]},
                    {"description": "Write the UI", "scope": ["ui.rs"]}
                ]}"#
            } else {
                let message = last_user_message(request);
                assert!(message.contains("### api (complete)"));
                assert!(message.contains("two tasks out"));
                r#"{"scratchpad": "all done", "tasks": []}"#
            };
            Ok(text_response(text))
        });

        let report = p.run_loop("Build a todo app").await.unwrap();
        assert_eq!(report.iterations, 2);
        assert_eq!(report.tasks_created, 2);
        assert_eq!(report.handoffs, 2);
        assert_eq!(p.iterations(), 2);
        assert_eq!(h.queue.get("api").unwrap().status, TaskStatus::Complete);
        assert_eq!(h.queue.get_completed_count(), 2);
        assert_eq!(h.merge.queue_len(), 2);
    }

    #[tokio::test]
    async fn test_consecutive_failures_abort() {
        let h = harness(quick_sandbox(), 2);
        let config = planner_config();
        let p = planner(&h, &config, |_| Ok(text_response("no json here")));

        let err = p.run_loop("anything").await.unwrap_err();
        assert!(format!("{:#}", err).contains("3 consecutive failures"));
        assert_eq!(p.iterations(), 0);
    }

    #[tokio::test]
    async fn test_injected_fix_tasks_are_dispatched() {
        let h = harness(quick_sandbox(), 2);
        let config = planner_config();
        let p = planner(&h, &config, |_| Ok(text_response(r#"{"tasks": []}"#)));

        let fix = Task::with_id("fix-1", "Repair the build", "worker/").with_priority(FIX_PRIORITY);
        assert!(p.inject(fix));
        let report = p.run_loop("anything").await.unwrap();

        assert_eq!(h.queue.get("fix-1").unwrap().status, TaskStatus::Complete);
        assert_eq!(report.handoffs, 1);
        assert_eq!(report.iterations, 2);
    }

    #[tokio::test]
    async fn test_inject_after_loop_ends_is_refused() {
        let h = harness(quick_sandbox(), 2);
        let config = planner_config();
        let p = planner(&h, &config, |_| Ok(text_response(r#"{"tasks": []}"#)));

        let report = p.run_loop("anything").await.unwrap();
        assert_eq!(report.iterations, 1);

        let late = Task::with_id("fix-late", "Repair the build", "worker/").with_priority(FIX_PRIORITY);
        assert!(!p.inject(late));
        assert!(h.queue.get("fix-late").is_none());
    }

    #[tokio::test]
    async fn test_failed_handoffs_feed_the_next_round() {
        let h = harness(quick_sandbox().with_status("flaky", HandoffStatus::Failed), 2);
        let config = planner_config();
        let p = planner(&h, &config, |request| {
            let text = if request.messages.len() == 1 {
                r#"[{"id": "flaky", "description": "Sometimes fails"}]"#
            } else {
                assert!(last_user_message(request).contains("### flaky (failed)"));
                r#"{"tasks": []}"#
            };
            Ok(text_response(text))
        });

        p.run_loop("anything").await.unwrap();
        assert_eq!(h.queue.get("flaky").unwrap().status, TaskStatus::Failed);
        assert_eq!(h.merge.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_build_tasks_regenerates_taken_ids() {
        let h = harness(quick_sandbox(), 1);
        let config = planner_config();
        let p = planner(&h, &config, |_| Ok(text_response("{}")));
        h.dispatcher.submit(Task::with_id("taken", "existing", "worker/")).unwrap();

        let mut first = RawTask::new("a");
        first.id = Some("taken".into());
        let mut second = RawTask::new("b");
        second.id = Some("fresh".into());
        let mut third = RawTask::new("c");
        third.id = Some("fresh".into());

        let tasks = p.build_tasks(vec![first, second, third]);
        assert_ne!(tasks[0].id, "taken");
        assert_eq!(tasks[1].id, "fresh");
        assert_ne!(tasks[2].id, "fresh");
    }
}

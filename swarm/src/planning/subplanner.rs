//! Subplanner - recursive decomposition of oversized tasks

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, warn};

use super::conversation::{Backoff, CallSettings, Conversation, complete_text, render_handoffs, render_scratchpad};
use super::parse::{RawTask, parse_plan_response};
use crate::config::{Config, SubplannerConfig};
use crate::domain::{Handoff, HandoffMetrics, HandoffStatus, Task};
use crate::llm::LlmClient;
use crate::prompts::{PromptContext, PromptLoader};
use crate::worker::TaskDispatcher;

/// Whether a task at `depth` should be split rather than dispatched
pub fn should_decompose(task: &Task, depth: u32, config: &SubplannerConfig) -> bool {
    depth < config.max_depth && task.scope.len() >= config.scope_threshold
}

fn normalize_path(path: &str) -> &str {
    let path = path.trim();
    path.strip_prefix("./").unwrap_or(path)
}

fn in_scope(file: &str, parent_scope: &[String]) -> bool {
    parent_scope.iter().any(|entry| {
        let entry = normalize_path(entry);
        file == entry || (entry.ends_with('/') && file.starts_with(entry))
    })
}

/// Drop files outside the parent's scope; `None` if nothing is left
///
/// A parent scope entry ending in `/` covers everything under it.
pub fn strip_scope(mut raw: RawTask, parent_scope: &[String]) -> Option<RawTask> {
    let before = raw.scope.len();
    let mut kept: Vec<String> = Vec::new();
    for file in &raw.scope {
        let file = normalize_path(file);
        if in_scope(file, parent_scope) && !kept.iter().any(|k| k == file) {
            kept.push(file.to_string());
        }
    }
    if kept.len() < before {
        debug!(description = %raw.description, before, after = kept.len(), "strip_scope: removed files outside parent scope");
    }
    if kept.is_empty() {
        return None;
    }
    raw.scope = kept;
    Some(raw)
}

/// Fold subtask handoffs into one handoff for the parent
///
/// `complete` only if every subtask completed, `failed` only if every subtask
/// failed, `partial` otherwise. Metrics are summed except duration, which is
/// the longest subtask.
pub fn aggregate_handoffs(parent_id: &str, handoffs: &[Handoff]) -> Handoff {
    if handoffs.is_empty() {
        return Handoff::failed(parent_id, "decomposition produced no subtasks");
    }

    let status = if handoffs.iter().all(|h| h.status == HandoffStatus::Complete) {
        HandoffStatus::Complete
    } else if handoffs.iter().all(|h| h.status == HandoffStatus::Failed) {
        HandoffStatus::Failed
    } else {
        HandoffStatus::Partial
    };

    let mut files_changed: Vec<String> = Vec::new();
    let mut metrics = HandoffMetrics::default();
    for handoff in handoffs {
        for file in &handoff.files_changed {
            if !files_changed.contains(file) {
                files_changed.push(file.clone());
            }
        }
        metrics.lines_added += handoff.metrics.lines_added;
        metrics.lines_removed += handoff.metrics.lines_removed;
        metrics.files_created += handoff.metrics.files_created;
        metrics.files_modified += handoff.metrics.files_modified;
        metrics.tokens_used += handoff.metrics.tokens_used;
        metrics.tool_call_count += handoff.metrics.tool_call_count;
        metrics.duration_ms = metrics.duration_ms.max(handoff.metrics.duration_ms);
    }

    Handoff {
        task_id: parent_id.to_string(),
        status,
        summary: handoffs
            .iter()
            .map(|h| format!("[{}] {}", h.task_id, h.summary.trim()))
            .collect::<Vec<_>>()
            .join("\n"),
        diff: handoffs
            .iter()
            .map(|h| h.diff.as_str())
            .filter(|d| !d.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        files_changed,
        concerns: handoffs.iter().flat_map(|h| h.concerns.iter().cloned()).collect(),
        suggestions: handoffs.iter().flat_map(|h| h.suggestions.iter().cloned()).collect(),
        metrics,
    }
}

fn render_parent(task: &Task) -> String {
    let mut out = format!("## Parent task {}\n\n{}\n\n### Scope\n\n", task.id, task.description.trim());
    for file in &task.scope {
        out.push_str(&format!("- {}\n", file));
    }
    if !task.acceptance.trim().is_empty() {
        out.push_str(&format!("\n### Acceptance\n\n{}\n", task.acceptance.trim()));
    }
    out.push_str("\nSplit this task into subtasks.\n");
    out
}

/// Splits tasks whose scope is too large for one worker
///
/// Each decomposition runs its own conversation, restricted to the parent's
/// files. Subtasks go through the shared dispatcher, or recurse one level
/// deeper when they are still too large.
pub struct Subplanner {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<TaskDispatcher>,
    prompts: Arc<PromptLoader>,
    prompt_context: PromptContext,
    config: SubplannerConfig,
    settings: CallSettings,
    char_budget: usize,
    keep_recent: usize,
    branch_prefix: String,
    backoff: Backoff,
    running: AtomicBool,
}

impl Subplanner {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: Arc<TaskDispatcher>,
        prompts: Arc<PromptLoader>,
        config: &Config,
    ) -> Self {
        debug!(
            max_depth = config.subplanner.max_depth,
            scope_threshold = config.subplanner.scope_threshold,
            "Subplanner::new: called"
        );
        Self {
            llm,
            dispatcher,
            prompts,
            prompt_context: PromptContext::from_config(config),
            config: config.subplanner.clone(),
            settings: CallSettings {
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
                max_continuations: config.planner.max_continuations,
            },
            char_budget: config.planner.history_char_budget,
            keep_recent: config.planner.keep_recent_exchanges,
            branch_prefix: config.git.branch_prefix.clone(),
            backoff: Backoff::default(),
            running: AtomicBool::new(true),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// No new decomposition rounds start after this; running subtasks finish
    pub fn stop(&self) {
        debug!("Subplanner::stop: called");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run a task to its handoff, decomposing it first if it is too large
    pub fn execute(self: Arc<Self>, task: Task, depth: u32) -> BoxFuture<'static, Handoff> {
        Box::pin(async move {
            if should_decompose(&task, depth, &self.config) {
                self.decompose(task, depth).await
            } else {
                self.dispatcher.dispatch_leaf(&task, depth).await
            }
        })
    }

    fn build_subtasks(&self, parent: &Task, raw: Vec<RawTask>, next_index: &mut usize) -> Vec<Task> {
        raw.into_iter()
            .filter_map(|raw| strip_scope(raw, &parent.scope))
            .map(|raw| {
                *next_index += 1;
                let priority = raw.priority.unwrap_or(parent.priority);
                raw.into_task(format!("{}-sub-{}", parent.id, next_index), &self.branch_prefix)
                    .with_parent(parent.id.clone())
                    .with_priority(priority)
            })
            .collect()
    }

    async fn decompose(self: Arc<Self>, task: Task, depth: u32) -> Handoff {
        info!(task_id = %task.id, depth, scope = task.scope.len(), "Decomposing task");
        let system_prompt = match self.prompts.render("subplanner", &self.prompt_context.at_depth(depth)) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Subplanner prompt failed to render, dispatching directly");
                return self.dispatcher.dispatch_leaf(&task, depth).await;
            }
        };

        let mut conversation = Conversation::new(self.char_budget, self.keep_recent);
        let mut next_message = render_parent(&task);
        let mut scratchpad: Option<String> = None;
        let mut handoffs: Vec<Handoff> = Vec::new();
        let mut next_index = 0usize;
        let mut rounds = 0u32;
        let mut failures = 0u32;
        let mut started = false;

        while rounds < self.config.max_rounds && self.is_running() {
            let messages = conversation.messages(&next_message);
            let parsed = match complete_text(self.llm.as_ref(), &system_prompt, messages, &self.settings).await {
                Ok(completed) => {
                    self.dispatcher.monitor().record_usage(&completed.usage);
                    parse_plan_response(&completed.text)
                        .map(|response| (completed.text, response))
                        .map_err(|e| e.to_string())
                }
                Err(e) => Err(e.to_string()),
            };

            let (text, response) = match parsed {
                Ok(parsed) => parsed,
                Err(error) => {
                    failures += 1;
                    warn!(task_id = %task.id, failures, %error, "Subplanner round failed");
                    if failures >= self.config.max_consecutive_failures {
                        break;
                    }
                    tokio::time::sleep(self.backoff.delay(failures)).await;
                    continue;
                }
            };
            failures = 0;
            rounds += 1;
            if response.scratchpad.is_some() {
                scratchpad = response.scratchpad;
            }

            let proposed = response.tasks.len();
            let subtasks = self.build_subtasks(&task, response.tasks, &mut next_index);
            let handoffs_reviewed = if rounds == 1 { 0 } else { handoffs.len() };
            conversation.record(next_message, text, subtasks.len(), handoffs_reviewed);
            debug!(task_id = %task.id, round = rounds, proposed, accepted = subtasks.len(), "Subplanner round parsed");
            if subtasks.is_empty() {
                break;
            }

            if !started {
                if let Err(e) = self.dispatcher.begin_decomposition(&task) {
                    warn!(task_id = %task.id, error = %e, "Parent task could not be started");
                    return Handoff::failed(task.id.clone(), format!("parent could not be started: {}", e));
                }
                started = true;
            }

            let mut in_flight = FuturesUnordered::new();
            for subtask in subtasks {
                if let Err(e) = self.dispatcher.register(subtask.clone()) {
                    warn!(task_id = %subtask.id, error = %e, "Subtask could not be registered");
                    continue;
                }
                in_flight.push(Arc::clone(&self).execute(subtask, depth + 1));
            }

            let mut round = Vec::new();
            while let Some(handoff) = in_flight.next().await {
                round.push(handoff);
            }
            next_message = format!(
                "## Subtask handoffs\n\n{}\n{}",
                render_handoffs(&round),
                render_scratchpad(scratchpad.as_deref())
            );
            handoffs.extend(round);
        }

        if !started {
            info!(task_id = %task.id, "No subtasks proposed, dispatching task directly");
            return self.dispatcher.dispatch_leaf(&task, depth).await;
        }

        let aggregate = aggregate_handoffs(&task.id, &handoffs);
        info!(task_id = %task.id, status = %aggregate.status, subtasks = handoffs.len(), "Decomposition finished");
        self.dispatcher.finish_decomposition(&task, &aggregate);
        aggregate
    }
}

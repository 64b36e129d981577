//! Planning conversation history and model calls

use std::time::Duration;

use tracing::{debug, info};

use crate::domain::Handoff;
use crate::llm::{CompletionRequest, LlmClient, LlmError, Message, TokenUsage};

/// Sent after a response stopped at the token limit
pub const CONTINUE_PROMPT: &str =
    "Your previous response was cut off. Continue exactly where it stopped. Do not repeat anything.";

/// One request/response round
#[derive(Debug, Clone, PartialEq)]
struct Exchange {
    user: String,
    assistant: String,
    tasks: usize,
    handoffs: usize,
}

impl Exchange {
    fn char_len(&self) -> usize {
        self.user.chars().count() + self.assistant.chars().count()
    }
}

/// Totals of the exchanges folded away by compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactedStats {
    pub exchanges: usize,
    pub tasks: usize,
    pub handoffs: usize,
}

/// A long-running conversation with a planning model
///
/// The opening message (the request plus the first repository snapshot) is
/// always kept. Once the history grows past `char_budget`, everything but the
/// most recent `keep_recent` exchanges is replaced by a one-line summary.
#[derive(Debug, Clone)]
pub struct Conversation {
    opening: Option<Exchange>,
    exchanges: Vec<Exchange>,
    compacted: CompactedStats,
    rounds: usize,
    char_budget: usize,
    keep_recent: usize,
}

impl Conversation {
    pub fn new(char_budget: usize, keep_recent: usize) -> Self {
        debug!(char_budget, keep_recent, "Conversation::new: called");
        Self {
            opening: None,
            exchanges: Vec::new(),
            compacted: CompactedStats::default(),
            rounds: 0,
            char_budget,
            keep_recent: keep_recent.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.opening.is_none()
    }

    /// Rounds recorded, including compacted ones
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn compacted(&self) -> CompactedStats {
        self.compacted
    }

    pub fn char_len(&self) -> usize {
        self.opening.iter().chain(&self.exchanges).map(Exchange::char_len).sum()
    }

    fn summary(&self) -> String {
        format!(
            "[Earlier rounds compacted: {} rounds, {} tasks dispatched, {} handoffs reviewed. \
             My scratchpad carries what still matters.]",
            self.compacted.exchanges, self.compacted.tasks, self.compacted.handoffs
        )
    }

    /// Messages for the next call, ending with `next_user`
    pub fn messages(&self, next_user: &str) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(opening) = &self.opening {
            messages.push(Message::user(opening.user.clone()));
            if self.compacted.exchanges > 0 {
                messages.push(Message::assistant(self.summary()));
            } else {
                messages.push(Message::assistant(opening.assistant.clone()));
            }
        }
        for exchange in &self.exchanges {
            messages.push(Message::user(exchange.user.clone()));
            messages.push(Message::assistant(exchange.assistant.clone()));
        }
        messages.push(Message::user(next_user));
        messages
    }

    /// Record a finished round, compacting if the history is over budget
    pub fn record(&mut self, user: String, assistant: String, tasks: usize, handoffs: usize) {
        self.rounds += 1;
        let exchange = Exchange {
            user,
            assistant,
            tasks,
            handoffs,
        };
        if self.opening.is_none() {
            self.opening = Some(exchange);
        } else {
            self.exchanges.push(exchange);
        }
        if self.char_len() > self.char_budget {
            self.compact();
        }
    }

    fn compact(&mut self) {
        if self.exchanges.len() <= self.keep_recent {
            return;
        }
        if self.compacted.exchanges == 0
            && let Some(opening) = &self.opening
        {
            // The opening reply is folded into the summary along with the rest
            self.compacted.exchanges += 1;
            self.compacted.tasks += opening.tasks;
            self.compacted.handoffs += opening.handoffs;
        }

        let drop = self.exchanges.len() - self.keep_recent;
        for exchange in self.exchanges.drain(..drop) {
            self.compacted.exchanges += 1;
            self.compacted.tasks += exchange.tasks;
            self.compacted.handoffs += exchange.handoffs;
        }
        info!(
            compacted = self.compacted.exchanges,
            kept = self.exchanges.len(),
            chars = self.char_len(),
            "Conversation compacted"
        );
    }
}

/// Model settings shared by every planning call
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub max_continuations: u32,
}

/// Text of one model answer, with continuations stitched on
#[derive(Debug, Clone, Default)]
pub struct CompletedText {
    pub text: String,
    pub usage: TokenUsage,
    pub continuations: u32,
}

/// Call the model and keep asking it to continue while it hits the token limit
pub async fn complete_text(
    llm: &dyn LlmClient,
    system_prompt: &str,
    messages: Vec<Message>,
    settings: &CallSettings,
) -> Result<CompletedText, LlmError> {
    debug!(messages = messages.len(), "complete_text: called");
    let mut messages = messages;
    let mut completed = CompletedText::default();

    loop {
        let request = CompletionRequest::new(system_prompt, messages.clone(), settings.max_tokens)
            .with_temperature(settings.temperature);
        let response = llm.complete(request).await?;
        completed.usage += response.usage;
        let chunk = response.text().to_string();
        completed.text.push_str(&chunk);

        if !response.is_truncated() || completed.continuations >= settings.max_continuations {
            if response.is_truncated() {
                debug!("complete_text: still truncated after max continuations");
            }
            return Ok(completed);
        }

        completed.continuations += 1;
        debug!(continuation = completed.continuations, "complete_text: response truncated, continuing");
        messages.push(Message::assistant(chunk));
        messages.push(Message::user(CONTINUE_PROMPT));
    }
}

/// Exponential backoff between failed planning calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay after the `failures`-th consecutive failure (1-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.cap)
    }
}

/// Handoffs as a prompt section
pub fn render_handoffs(handoffs: &[Handoff]) -> String {
    if handoffs.is_empty() {
        return "No handoffs since the last round.\n".to_string();
    }
    let mut out = String::new();
    for handoff in handoffs {
        out.push_str(&format!("### {} ({})\n\n{}\n", handoff.task_id, handoff.status, handoff.summary.trim()));
        if !handoff.files_changed.is_empty() {
            out.push_str(&format!("\nFiles changed: {}\n", handoff.files_changed.join(", ")));
        }
        for concern in &handoff.concerns {
            out.push_str(&format!("- Concern: {}\n", concern));
        }
        for suggestion in &handoff.suggestions {
            out.push_str(&format!("- Suggestion: {}\n", suggestion));
        }
        out.push('\n');
    }
    out
}

/// The scratchpad echoed back to the model
pub fn render_scratchpad(scratchpad: Option<&str>) -> String {
    match scratchpad {
        Some(text) if !text.trim().is_empty() => format!("## Your scratchpad\n\n{}\n", text.trim()),
        _ => "## Your scratchpad\n\n(empty)\n".to_string(),
    }
}

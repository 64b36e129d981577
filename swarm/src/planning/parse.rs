//! Planning response parsing
//!
//! Models answer with a `{scratchpad, tasks}` object, a bare task array, or
//! something broken. Each stage here is a pure function from text to a typed
//! result; `parse_plan_response` tries them in order.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::{DEFAULT_PRIORITY, Task};

/// A task as the model wrote it; only `description` is required
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawTask {
    pub id: Option<String>,
    pub description: String,
    #[serde(alias = "files")]
    pub scope: Vec<String>,
    pub acceptance: Option<String>,
    pub branch: Option<String>,
    pub priority: Option<u32>,
}

impl RawTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: &[&str]) -> Self {
        self.scope = scope.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Model-supplied id, if it gave a usable one
    pub fn requested_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Build a pending task; `id` wins over whatever the model asked for
    pub fn into_task(self, id: impl Into<String>, branch_prefix: &str) -> Task {
        let mut task = Task::with_id(id, self.description.trim(), branch_prefix)
            .with_scope(self.scope)
            .with_priority(self.priority.unwrap_or(DEFAULT_PRIORITY));
        if let Some(acceptance) = self.acceptance {
            task = task.with_acceptance(acceptance);
        }
        if let Some(branch) = self.branch.filter(|b| !b.trim().is_empty()) {
            task = task.with_branch(branch.trim());
        }
        task
    }
}

/// Which stage produced the tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Structured,
    BareArray,
    Salvaged,
}

/// Parsed planning response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResponse {
    pub scratchpad: Option<String>,
    pub tasks: Vec<RawTask>,
    pub format: ResponseFormat,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty response")]
    Empty,

    #[error("No tasks could be parsed from response: {preview}")]
    Unparseable { preview: String },
}

/// Body of the first fenced code block, or the trimmed text if there is none
///
/// An unterminated fence (a truncated response) yields everything after it.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Index of the bracket closing the one at `start`, skipping string contents
fn balanced_end(text: &str, start: usize, open: u8, close: u8) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(start + offset);
            }
        }
    }
    None
}

/// First complete JSON value opened by `open`
fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = balanced_end(text, start, open as u8, close as u8)?;
    Some(&text[start..=end])
}

fn raw_task_from_value(value: Value) -> Option<RawTask> {
    serde_json::from_value::<RawTask>(value)
        .ok()
        .filter(|task| !task.description.trim().is_empty())
}

fn raw_tasks_from_values(values: Vec<Value>) -> Vec<RawTask> {
    let total = values.len();
    let tasks: Vec<RawTask> = values.into_iter().filter_map(raw_task_from_value).collect();
    if tasks.len() < total {
        debug!(dropped = total - tasks.len(), "raw_tasks_from_values: dropped invalid task objects");
    }
    tasks
}

/// Stage 1: a `{scratchpad, tasks}` object
pub fn parse_structured(text: &str) -> Option<PlanResponse> {
    let candidate = first_balanced(text, '{', '}')?;
    let Value::Object(mut object) = serde_json::from_str::<Value>(candidate).ok()? else {
        return None;
    };
    if !object.contains_key("tasks") && !object.contains_key("scratchpad") {
        return None;
    }

    let scratchpad = match object.remove("scratchpad") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    let tasks = match object.remove("tasks") {
        Some(Value::Array(values)) => raw_tasks_from_values(values),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return None,
    };
    Some(PlanResponse {
        scratchpad,
        tasks,
        format: ResponseFormat::Structured,
    })
}

/// Stage 2: a bare array of tasks
pub fn parse_bare_array(text: &str) -> Option<PlanResponse> {
    let candidate = first_balanced(text, '[', ']')?;
    let Value::Array(values) = serde_json::from_str::<Value>(candidate).ok()? else {
        return None;
    };
    Some(PlanResponse {
        scratchpad: None,
        tasks: raw_tasks_from_values(values),
        format: ResponseFormat::BareArray,
    })
}

/// Stage 3: every complete task object anywhere in the text
pub fn salvage_tasks(text: &str) -> Vec<RawTask> {
    let mut tasks = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        if let Some(end) = balanced_end(text, start, b'{', b'}')
            && let Some(task) = serde_json::from_str::<Value>(&text[start..=end])
                .ok()
                .and_then(raw_task_from_value)
        {
            tasks.push(task);
            pos = end + 1;
            continue;
        }
        pos = start + 1;
    }
    tasks
}

/// The scratchpad string, if its value survived intact
pub fn salvage_scratchpad(text: &str) -> Option<String> {
    let key = text.find("\"scratchpad\"")?;
    let rest = &text[key + "\"scratchpad\"".len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    if !rest.starts_with('"') {
        return None;
    }

    let bytes = rest.as_bytes();
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            return serde_json::from_str::<String>(&rest[..=i]).ok();
        }
    }
    None
}

fn parse_stages(text: &str) -> Option<PlanResponse> {
    parse_structured(text).or_else(|| parse_bare_array(text))
}

/// Parse a planning response: structured object, then bare array, then salvage
pub fn parse_plan_response(text: &str) -> Result<PlanResponse, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let body = strip_code_fences(text);
    if let Some(response) = parse_stages(body).or_else(|| parse_stages(text)) {
        debug!(format = ?response.format, tasks = response.tasks.len(), "parse_plan_response: parsed");
        return Ok(response);
    }

    let tasks = salvage_tasks(text);
    if tasks.is_empty() {
        return Err(ParseError::Unparseable {
            preview: text.trim().chars().take(200).collect(),
        });
    }
    debug!(tasks = tasks.len(), "parse_plan_response: salvaged partial response");
    Ok(PlanResponse {
        scratchpad: salvage_scratchpad(text),
        tasks,
        format: ResponseFormat::Salvaged,
    })
}

//! Sandbox abstraction and the task assignment payload

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::WorkerError;
use crate::domain::{Handoff, Task};

/// Assignment type tag expected by sandboxes
pub const ASSIGNMENT_TYPE: &str = "task_assignment";

/// Model settings resolved for one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentLlmConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Everything a sandbox needs to run one task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignment {
    #[serde(rename = "type")]
    pub kind: String,
    pub task: Task,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    pub llm_config: AssignmentLlmConfig,
}

impl TaskAssignment {
    pub fn new(task: Task, system_prompt: String, repo_url: Option<String>, llm_config: AssignmentLlmConfig) -> Self {
        Self {
            kind: ASSIGNMENT_TYPE.to_string(),
            task,
            system_prompt,
            repo_url,
            llm_config,
        }
    }
}

/// An isolated execution unit launcher
///
/// Each `run` provisions one ephemeral unit, blocks until it reports a handoff
/// or fails, and tears it down.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short launcher name for logs
    fn kind(&self) -> &'static str;

    async fn run(&self, assignment: &TaskAssignment, timeout: Duration) -> Result<Handoff, WorkerError>;
}

/// Parse a handoff from sandbox output
///
/// Accepts a bare handoff object or one wrapped as `{"handoff": {...}}`.
pub fn parse_handoff(text: &str) -> Result<Handoff, WorkerError> {
    debug!(len = text.len(), "parse_handoff: called");
    let value: serde_json::Value =
        serde_json::from_str(text.trim()).map_err(|e| WorkerError::MalformedHandoff(e.to_string()))?;

    let inner = match value.get("handoff") {
        Some(handoff) if handoff.is_object() => handoff.clone(),
        _ => value,
    };

    serde_json::from_value(inner).map_err(|e| WorkerError::MalformedHandoff(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HandoffStatus;

    #[test]
    fn test_parse_bare_handoff() {
        let handoff = parse_handoff(r#"{"taskId": "t1", "status": "partial", "summary": "half"}"#).unwrap();
        assert_eq!(handoff.task_id, "t1");
        assert_eq!(handoff.status, HandoffStatus::Partial);
        assert!(handoff.files_changed.is_empty());
    }

    #[test]
    fn test_parse_wrapped_handoff() {
        let handoff = parse_handoff(r#"{"success": true, "handoff": {"taskId": "t2", "status": "complete"}}"#).unwrap();
        assert_eq!(handoff.task_id, "t2");
        assert_eq!(handoff.status, HandoffStatus::Complete);
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_handoff("done!"), Err(WorkerError::MalformedHandoff(_))));
        assert!(matches!(
            parse_handoff(r#"{"taskId": "t1", "status": "exploded"}"#),
            Err(WorkerError::MalformedHandoff(_))
        ));
    }

    #[test]
    fn test_assignment_wire_shape() {
        let assignment = TaskAssignment::new(
            Task::with_id("t1", "Add a login page", "worker/"),
            "You are a worker".to_string(),
            Some("https://git.example.com/repo.git".to_string()),
            AssignmentLlmConfig {
                endpoint: "http://llm:8000".to_string(),
                model: "glm-5".to_string(),
                max_tokens: 4096,
                temperature: 0.2,
                api_key: None,
            },
        );

        let json = serde_json::to_value(&assignment).unwrap();
        assert_eq!(json["type"], "task_assignment");
        assert_eq!(json["task"]["id"], "t1");
        assert_eq!(json["systemPrompt"], "You are a worker");
        assert_eq!(json["llmConfig"]["maxTokens"], 4096);
        assert!(json["llmConfig"].get("apiKey").is_none());
    }
}

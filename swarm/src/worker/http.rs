//! Sandbox reached over HTTP

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::error::WorkerError;
use super::sandbox::{Sandbox, TaskAssignment, parse_handoff};
use crate::domain::Handoff;

/// Timeout for health probes
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness reported by `GET /health`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxHealth {
    #[serde(default)]
    pub status: String,
    /// Task currently being worked on, if any
    #[serde(default, alias = "taskId")]
    pub current_task: Option<String>,
}

/// Posts assignments to a sandbox server
///
/// `POST {url}/task` with the assignment JSON; the response body is the
/// handoff, bare or wrapped as `{"handoff": ...}`.
pub struct HttpSandbox {
    base_url: String,
    http: Client,
}

impl HttpSandbox {
    pub fn new(base_url: impl Into<String>) -> Result<Self, WorkerError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(%base_url, "HttpSandbox::new: called");
        let http = Client::builder().build()?;
        Ok(Self { base_url, http })
    }

    pub fn task_url(&self) -> String {
        format!("{}/task", self.base_url)
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url)
    }

    /// Probe the sandbox server
    pub async fn health(&self) -> Result<SandboxHealth, WorkerError> {
        debug!(url = %self.health_url(), "HttpSandbox::health: called");
        let response = self.http.get(self.health_url()).timeout(HEALTH_TIMEOUT).send().await?;
        if !response.status().is_success() {
            return Err(WorkerError::Transport(format!("health check returned {}", response.status())));
        }
        Ok(response.json::<SandboxHealth>().await?)
    }
}

#[async_trait]
impl Sandbox for HttpSandbox {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn run(&self, assignment: &TaskAssignment, timeout: Duration) -> Result<Handoff, WorkerError> {
        let task_id = &assignment.task.id;
        debug!(%task_id, url = %self.task_url(), "HttpSandbox::run: called");

        let response = match self.http.post(self.task_url()).json(assignment).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(WorkerError::Timeout(timeout)),
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Err(WorkerError::Timeout(timeout)),
            Err(e) => return Err(e.into()),
        };
        if !status.is_success() {
            debug!(%task_id, %status, "HttpSandbox::run: task submission failed");
            return Err(WorkerError::Transport(format!("task submission failed ({}): {}", status, body)));
        }

        parse_handoff(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandoffStatus, Task};
    use crate::worker::sandbox::AssignmentLlmConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP request with a canned response, returning the request text
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            let lower = l.to_ascii_lowercase();
                            lower.strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (url, handle)
    }

    fn local(url: String) -> HttpSandbox {
        HttpSandbox {
            base_url: url,
            http: Client::builder().no_proxy().build().unwrap(),
        }
    }

    fn assignment() -> TaskAssignment {
        TaskAssignment::new(
            Task::with_id("t7", "Add physics", "worker/"),
            "prompt".to_string(),
            None,
            AssignmentLlmConfig {
                endpoint: "http://llm".to_string(),
                model: "glm-5".to_string(),
                max_tokens: 100,
                temperature: 0.0,
                api_key: None,
            },
        )
    }

    #[test]
    fn test_urls_trim_trailing_slash() {
        let sandbox = HttpSandbox::new("http://sandbox:8080/").unwrap();
        assert_eq!(sandbox.task_url(), "http://sandbox:8080/task");
        assert_eq!(sandbox.health_url(), "http://sandbox:8080/health");
    }

    #[tokio::test]
    async fn test_post_task_accepts_wrapped_handoff() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"success":true,"handoff":{"taskId":"t7","status":"blocked","summary":"needs API key"}}"#,
        )
        .await;

        let sandbox = local(url);
        let handoff = sandbox.run(&assignment(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(handoff.status, HandoffStatus::Blocked);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /task"));
        assert!(request.contains("task_assignment"));
    }

    #[tokio::test]
    async fn test_error_status_is_transport_error() {
        let (url, _server) = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;

        let sandbox = local(url);
        let err = sandbox.run(&assignment(), Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Transport(ref m) if m.contains("boom")));
    }

    #[tokio::test]
    async fn test_health() {
        let (url, _server) = serve_once("200 OK", r#"{"status":"ok","taskId":"t3"}"#).await;

        let sandbox = local(url);
        let health = sandbox.health().await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.current_task.as_deref(), Some("t3"));
    }
}

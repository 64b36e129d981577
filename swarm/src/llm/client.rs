//! LlmClient trait definition

use async_trait::async_trait;

use super::{CompletionRequest, CompletionResponse, LlmError};

/// Stateless chat-completion client
///
/// Each call is independent; conversation state lives with the caller and is
/// sent in full on every request.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single completion request and wait for the full response
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::llm::{StopReason, TokenUsage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing::debug;

    /// Plain text response with small fixed usage
    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: Some(text.to_string()),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
            },
            endpoint: Some("mock".to_string()),
        }
    }

    /// Response cut off at the token limit
    pub fn truncated_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            stop_reason: StopReason::MaxTokens,
            ..text_response(text)
        }
    }

    /// Mock LLM client for unit tests
    ///
    /// Returns scripted responses in order, then errors once exhausted.
    pub struct MockLlmClient {
        responses: Vec<CompletionResponse>,
        call_count: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<CompletionResponse>) -> Self {
            debug!(response_count = %responses.len(), "MockLlmClient::new: called");
            Self {
                responses,
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn from_texts(texts: &[&str]) -> Self {
            Self::new(texts.iter().map(|t| text_response(t)).collect())
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// Every request received so far
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            debug!("MockLlmClient::complete: called");
            self.requests.lock().unwrap().push(request);
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.responses.get(idx).cloned().ok_or_else(|| {
                debug!(%idx, "MockLlmClient::complete: no more mock responses");
                LlmError::InvalidResponse("No more mock responses".to_string())
            })
        }
    }

    /// Answers each request with a closure, for callers that run concurrently
    pub struct FnLlmClient<F> {
        respond: F,
        call_count: AtomicUsize,
    }

    impl<F> FnLlmClient<F>
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync,
    {
        pub fn new(respond: F) -> Self {
            Self {
                respond,
                call_count: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> LlmClient for FnLlmClient<F>
    where
        F: Fn(&CompletionRequest) -> Result<CompletionResponse, LlmError> + Send + Sync,
    {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            (self.respond)(&request)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::llm::Message;

        #[tokio::test]
        async fn test_mock_client_returns_responses_in_order() {
            let client = MockLlmClient::from_texts(&["Response 1", "Response 2"]);
            let req = CompletionRequest::new("Test", vec![Message::user("hi")], 1000);

            let resp1 = client.complete(req.clone()).await.unwrap();
            assert_eq!(resp1.text(), "Response 1");

            let resp2 = client.complete(req.clone()).await.unwrap();
            assert_eq!(resp2.text(), "Response 2");

            assert!(client.complete(req).await.is_err());
            assert_eq!(client.call_count(), 3);
            assert_eq!(client.requests().len(), 3);
        }
    }
}

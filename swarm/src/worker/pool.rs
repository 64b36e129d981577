//! WorkerPool - one ephemeral sandbox per task

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use eyre::Result;
use rand::Rng;
use tracing::{debug, info, warn};

use super::error::WorkerError;
use super::http::HttpSandbox;
use super::sandbox::{AssignmentLlmConfig, Sandbox, TaskAssignment};
use super::subprocess::SubprocessSandbox;
use crate::config::{Config, LlmEndpoint, SandboxMode};
use crate::domain::{Handoff, Task};

/// Decrements the outstanding counter however the dispatch ends
struct OutstandingGuard<'a>(&'a AtomicUsize);

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pick an endpoint in proportion to its weight
fn pick_endpoint<'a>(endpoints: &'a [LlmEndpoint], rng: &mut impl Rng) -> Option<&'a LlmEndpoint> {
    let total: u64 = endpoints.iter().map(|e| u64::from(e.weight)).sum();
    if total == 0 {
        return endpoints.first();
    }
    let mut pick = rng.random_range(0..total);
    for endpoint in endpoints {
        let weight = u64::from(endpoint.weight);
        if pick < weight {
            return Some(endpoint);
        }
        pick -= weight;
    }
    endpoints.last()
}

/// Dispatches tasks to isolated sandboxes
///
/// Holds no persistent capacity: every `assign_task` provisions one unit and
/// tears it down when the handoff arrives. Concurrency is bounded by the
/// caller, not here.
pub struct WorkerPool {
    sandbox: Arc<dyn Sandbox>,
    system_prompt: String,
    repo_url: Option<String>,
    endpoints: Vec<LlmEndpoint>,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    outstanding: AtomicUsize,
    dispatched: AtomicU64,
}

impl WorkerPool {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &Config, system_prompt: String) -> Self {
        debug!(kind = sandbox.kind(), "WorkerPool::new: called");
        Self {
            sandbox,
            system_prompt,
            repo_url: config.target.repo_url.clone(),
            endpoints: config.llm.endpoints.clone(),
            model: config.llm.model.clone(),
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
            timeout: config.workers.timeout(),
            outstanding: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    /// Build the pool with the launcher selected by `workers.mode`
    pub fn from_config(config: &Config, system_prompt: String) -> Result<Self> {
        debug!(mode = ?config.workers.mode, "WorkerPool::from_config: called");
        let sandbox: Arc<dyn Sandbox> = match config.workers.mode {
            SandboxMode::Subprocess => Arc::new(
                SubprocessSandbox::new(&config.workers.command)?.with_working_dir(&config.target.repo_path),
            ),
            SandboxMode::Http => {
                let url = config
                    .workers
                    .url
                    .clone()
                    .ok_or_else(|| eyre::eyre!("workers.url is required in http mode"))?;
                Arc::new(HttpSandbox::new(url)?)
            }
        };
        Ok(Self::new(sandbox, config, system_prompt))
    }

    pub async fn start(&self) {
        info!(kind = self.sandbox.kind(), timeout_secs = self.timeout.as_secs(), "Worker pool ready");
    }

    pub async fn stop(&self) {
        info!(outstanding = self.outstanding_count(), "Worker pool stopped");
    }

    fn llm_config(&self) -> AssignmentLlmConfig {
        let endpoint = pick_endpoint(&self.endpoints, &mut rand::rng());
        AssignmentLlmConfig {
            endpoint: endpoint.map(|e| e.base_url.clone()).unwrap_or_default(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            api_key: endpoint.and_then(LlmEndpoint::resolve_api_key),
        }
    }

    /// Run one task in a fresh sandbox and wait for its handoff
    pub async fn assign_task(&self, task: &Task) -> Result<Handoff, WorkerError> {
        debug!(task_id = %task.id, branch = %task.branch, "WorkerPool::assign_task: called");
        let assignment = TaskAssignment::new(
            task.clone(),
            self.system_prompt.clone(),
            self.repo_url.clone(),
            self.llm_config(),
        );

        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let _guard = OutstandingGuard(&self.outstanding);

        let mut handoff = self.sandbox.run(&assignment, self.timeout).await?;
        if handoff.task_id != task.id {
            if !handoff.task_id.is_empty() {
                warn!(task_id = %task.id, reported = %handoff.task_id, "Handoff reported a different task id");
            }
            handoff.task_id = task.id.clone();
        }
        debug!(task_id = %task.id, status = %handoff.status, "WorkerPool::assign_task: handoff received");
        Ok(handoff)
    }

    /// Sandboxes currently running
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Dispatches started over the pool's lifetime
    pub fn total_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use crate::domain::HandoffStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted sandbox recording peak concurrency
    pub struct ScriptedSandbox {
        delay: Duration,
        statuses: Mutex<HashMap<String, HandoffStatus>>,
        errors: Mutex<HashMap<String, String>>,
        current: AtomicUsize,
        pub peak: AtomicUsize,
        pub runs: Mutex<Vec<String>>,
    }

    impl ScriptedSandbox {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                statuses: Mutex::new(HashMap::new()),
                errors: Mutex::new(HashMap::new()),
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                runs: Mutex::new(Vec::new()),
            }
        }

        /// Report this status for the task (default complete)
        pub fn with_status(self, task_id: &str, status: HandoffStatus) -> Self {
            self.statuses.lock().unwrap().insert(task_id.to_string(), status);
            self
        }

        /// Fail dispatch of this task with a transport error
        pub fn with_error(self, task_id: &str, message: &str) -> Self {
            self.errors.lock().unwrap().insert(task_id.to_string(), message.to_string());
            self
        }

        pub fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        pub fn runs(&self) -> Vec<String> {
            self.runs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, assignment: &TaskAssignment, _timeout: Duration) -> Result<Handoff, WorkerError> {
            let task_id = assignment.task.id.clone();
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.runs.lock().unwrap().push(task_id.clone());

            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if let Some(message) = self.errors.lock().unwrap().get(&task_id) {
                return Err(WorkerError::Transport(message.clone()));
            }
            let status = self
                .statuses
                .lock()
                .unwrap()
                .get(&task_id)
                .copied()
                .unwrap_or(HandoffStatus::Complete);
            let mut handoff = Handoff::failed(task_id.clone(), "scripted");
            handoff.status = status;
            handoff.summary = format!("{} {}", task_id, status);
            handoff.diff = format!("diff --git a/{0} b/{0}\n+done\n", task_id);
            handoff.files_changed = assignment.task.scope.clone();
            handoff.concerns.clear();
            handoff.suggestions.clear();
            handoff.metrics.tokens_used = 100;
            handoff.metrics.lines_added = 1;
            handoff.metrics.duration_ms = self.delay.as_millis() as u64;
            Ok(handoff)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedSandbox;
    use super::*;
    use crate::config::parse_endpoints;
    use crate::domain::HandoffStatus;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn config() -> Config {
        let mut config = Config::default();
        config.llm.endpoints = parse_endpoints("a=http://a@1,b=http://b@3").unwrap();
        config
    }

    #[tokio::test]
    async fn test_assign_task_returns_handoff() {
        let sandbox = Arc::new(ScriptedSandbox::new(Duration::from_millis(1)).with_status("t1", HandoffStatus::Partial));
        let pool = WorkerPool::new(sandbox.clone(), &config(), "prompt".to_string());

        let handoff = pool
            .assign_task(&Task::with_id("t1", "Do things", "worker/"))
            .await
            .unwrap();
        assert_eq!(handoff.status, HandoffStatus::Partial);
        assert_eq!(pool.outstanding_count(), 0);
        assert_eq!(pool.total_dispatched(), 1);
    }

    #[tokio::test]
    async fn test_errors_propagate_and_release_counter() {
        let sandbox = Arc::new(ScriptedSandbox::new(Duration::from_millis(1)).with_error("t1", "connection refused"));
        let pool = WorkerPool::new(sandbox, &config(), "prompt".to_string());

        let err = pool
            .assign_task(&Task::with_id("t1", "Do things", "worker/"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Transport(_)));
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_outstanding_counts_in_flight_units() {
        let sandbox = Arc::new(ScriptedSandbox::new(Duration::from_millis(200)));
        let pool = Arc::new(WorkerPool::new(sandbox, &config(), "prompt".to_string()));

        let running = pool.clone();
        let handle = tokio::spawn(async move { running.assign_task(&Task::with_id("t1", "slow", "worker/")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.outstanding_count(), 1);

        handle.await.unwrap().unwrap();
        assert_eq!(pool.outstanding_count(), 0);
    }

    #[test]
    fn test_pick_endpoint_by_weight() {
        let endpoints = parse_endpoints("a=http://a@1,b=http://b@3").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let b = (0..1000)
            .filter(|_| pick_endpoint(&endpoints, &mut rng).unwrap().name == "b")
            .count();
        assert!((650..850).contains(&b), "b picked {} times", b);
        assert!(pick_endpoint(&[], &mut rng).is_none());
    }
}

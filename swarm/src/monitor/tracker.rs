//! Monitor - aggregates metrics and flags misbehaving workers

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::domain::{Handoff, HandoffStatus, MetricsSnapshot, Task, TaskStatus};
use crate::events::{EventBus, SwarmEvent};
use crate::llm::TokenUsage;
use crate::merge::MergeResult;
use crate::queue::TaskQueue;
use crate::worker::WorkerPool;

/// Handoffs touching more files than this look like a runaway worker
pub const MAX_SUSPICIOUS_FILES: usize = 100;

/// Handoffs adding more lines than this look like a runaway worker
pub const MAX_SUSPICIOUS_LINES_ADDED: u64 = 50_000;

/// Called once for each task that exceeds the worker timeout
pub type TimeoutHandler = Arc<dyn Fn(&Task, i64) + Send + Sync>;

/// True when a running task has been running longer than `timeout`
pub fn is_timed_out(task: &Task, timeout: Duration, now: DateTime<Utc>) -> bool {
    if task.status != TaskStatus::Running {
        return false;
    }
    match task.running_for_ms(now) {
        Some(elapsed) => elapsed > timeout.as_millis() as i64,
        None => false,
    }
}

/// Why a handoff looks suspicious, if it does
pub fn suspicious_reason(handoff: &Handoff) -> Option<String> {
    if handoff.files_changed.len() > MAX_SUSPICIOUS_FILES {
        return Some(format!(
            "{} files changed (limit {})",
            handoff.files_changed.len(),
            MAX_SUSPICIOUS_FILES
        ));
    }
    if handoff.metrics.lines_added > MAX_SUSPICIOUS_LINES_ADDED {
        return Some(format!(
            "{} lines added (limit {})",
            handoff.metrics.lines_added, MAX_SUSPICIOUS_LINES_ADDED
        ));
    }
    None
}

/// Watches the queue and the pool, and keeps the run's counters
///
/// Timeouts are only reported. Cancelling the task or killing the sandbox is
/// left to whoever registered the timeout handler.
pub struct Monitor {
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    events: Arc<EventBus>,
    worker_timeout: Duration,
    poll_interval: Duration,
    cost_per_million_tokens: f64,
    started_at: DateTime<Utc>,
    tokens: AtomicU64,
    merge_attempts: AtomicU64,
    merge_successes: AtomicU64,
    timed_out: Mutex<HashSet<String>>,
    timeout_handlers: RwLock<Vec<TimeoutHandler>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Monitor {
    pub fn new(queue: Arc<TaskQueue>, pool: Arc<WorkerPool>, config: &Config, events: Arc<EventBus>) -> Self {
        debug!(
            timeout_secs = config.workers.timeout_secs,
            poll_interval_secs = config.monitor.poll_interval_secs,
            "Monitor::new: called"
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            queue,
            pool,
            events,
            worker_timeout: config.workers.timeout(),
            poll_interval: Duration::from_secs(config.monitor.poll_interval_secs.max(1)),
            cost_per_million_tokens: config.monitor.cost_per_million_tokens,
            started_at: Utc::now(),
            tokens: AtomicU64::new(0),
            merge_attempts: AtomicU64::new(0),
            merge_successes: AtomicU64::new(0),
            timed_out: Mutex::new(HashSet::new()),
            timeout_handlers: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Register a handler for worker timeouts
    pub fn on_timeout(&self, handler: TimeoutHandler) {
        self.timeout_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Count tokens spent outside workers (planning, fix planning)
    pub fn record_usage(&self, usage: &TokenUsage) {
        self.tokens.fetch_add(usage.total(), Ordering::Relaxed);
    }

    pub fn record_tokens(&self, tokens: u64) {
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
    }

    /// Count one merge result
    pub fn record_merge(&self, result: &MergeResult) {
        debug!(branch = %result.branch, status = result.outcome.label(), "Monitor::record_merge: called");
        if !result.outcome.is_attempt() {
            return;
        }
        self.merge_attempts.fetch_add(1, Ordering::Relaxed);
        if result.is_success() {
            self.merge_successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account a handoff and run the worker-behaviour heuristics on it
    pub fn record_handoff(&self, handoff: &Handoff) {
        debug!(task_id = %handoff.task_id, status = %handoff.status, "Monitor::record_handoff: called");
        self.tokens.fetch_add(handoff.metrics.tokens_used, Ordering::Relaxed);

        if handoff.status == HandoffStatus::Complete && handoff.is_empty_diff() {
            warn!(task_id = %handoff.task_id, "Task completed with an empty diff");
            self.events.emit(SwarmEvent::EmptyDiff {
                task_id: handoff.task_id.clone(),
            });
        }

        if let Some(reason) = suspicious_reason(handoff) {
            warn!(task_id = %handoff.task_id, %reason, "Suspicious handoff");
            self.events.emit(SwarmEvent::SuspiciousHandoff {
                task_id: handoff.task_id.clone(),
                reason,
            });
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }

    pub fn merge_success_rate(&self) -> f64 {
        let attempts = self.merge_attempts.load(Ordering::Relaxed);
        if attempts == 0 {
            return 0.0;
        }
        self.merge_successes.load(Ordering::Relaxed) as f64 / attempts as f64
    }

    /// Report running tasks past the timeout; each task is reported once
    pub fn check_timeouts(&self, now: DateTime<Utc>) -> Vec<String> {
        debug!("Monitor::check_timeouts: called");
        let mut fresh = Vec::new();
        for task in self.queue.tasks_with_status(TaskStatus::Running) {
            if !is_timed_out(&task, self.worker_timeout, now) {
                continue;
            }
            let first_time = self
                .timed_out
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task.id.clone());
            if !first_time {
                continue;
            }

            let elapsed_ms = task.running_for_ms(now).unwrap_or_default();
            warn!(task_id = %task.id, elapsed_ms, "Worker exceeded timeout");
            self.events.emit(SwarmEvent::WorkerTimedOut {
                task_id: task.id.clone(),
                elapsed_ms,
            });
            let handlers = self
                .timeout_handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for handler in handlers {
                handler(&task, elapsed_ms);
            }
            fresh.push(task.id);
        }
        fresh
    }

    /// Point-in-time metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let completed = self.queue.get_completed_count();
        let elapsed_hours = (now - self.started_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
        let commits_per_hour = if elapsed_hours > 0.0 {
            completed as f64 / elapsed_hours
        } else {
            0.0
        };
        let total_tokens_used = self.total_tokens();

        MetricsSnapshot {
            timestamp: now,
            active_workers: self.pool.outstanding_count(),
            pending_tasks: self.queue.get_pending_count(),
            running_tasks: self.queue.get_running_count(),
            completed_tasks: completed,
            failed_tasks: self.queue.get_failed_count(),
            commits_per_hour,
            merge_success_rate: self.merge_success_rate(),
            total_tokens_used,
            total_cost_usd: total_tokens_used as f64 / 1_000_000.0 * self.cost_per_million_tokens,
        }
    }

    /// One polling round: timeouts, then a metrics event
    pub fn poll(&self) -> MetricsSnapshot {
        let now = Utc::now();
        self.check_timeouts(now);
        let snapshot = self.snapshot_at(now);
        self.events.emit(SwarmEvent::Metrics(snapshot.clone()));
        snapshot
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        debug!(interval_secs = self.poll_interval.as_secs(), "Monitor::start: called");
        self.running.store(true, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.poll_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = monitor.poll();
                        info!(
                            active = snapshot.active_workers,
                            pending = snapshot.pending_tasks,
                            completed = snapshot.completed_tasks,
                            failed = snapshot.failed_tasks,
                            tokens = snapshot.total_tokens_used,
                            "Metrics"
                        );
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Monitor: polling loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        debug!("Monitor::stop: called");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

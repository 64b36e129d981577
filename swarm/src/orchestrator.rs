//! Orchestrator - wires the components together and runs one request
//!
//! Construction builds every component from one `Config`. `run` starts the
//! background loops, drives the planner to completion, finalizes (drain the
//! merge queue, sweep, dispatch fixes, repeat) and always ends by emitting a
//! `RunSummary`, whatever path the run took.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{Handoff, RunOutcome, RunSummary, Task, TaskStatus};
use crate::events::{DEFAULT_CHANNEL_CAPACITY, EventBus, SwarmEvent, spawn_event_logger};
use crate::llm::{LlmClient, LlmRouter};
use crate::merge::{GitCli, GitRunner, MergeQueue, MergeResult, new_git_lock};
use crate::monitor::Monitor;
use crate::planning::{Planner, Subplanner};
use crate::prompts::{PromptContext, PromptLoader};
use crate::queue::TaskQueue;
use crate::reconciler::Reconciler;
use crate::worker::{TaskDispatcher, WorkerPool};

/// Called when a component hits an error it cannot recover from
pub type ErrorHandler = Arc<dyn Fn(&str, &eyre::Report) + Send + Sync>;

/// Result of the finalization phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Finalization {
    pub sweeps: u32,
    pub healthy: Option<bool>,
}

pub struct Orchestrator {
    config: Config,
    events: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    pool: Arc<WorkerPool>,
    merge: Arc<MergeQueue>,
    monitor: Arc<Monitor>,
    dispatcher: Arc<TaskDispatcher>,
    planner: Arc<Planner>,
    reconciler: Arc<Reconciler>,
    error_handlers: RwLock<Vec<ErrorHandler>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    event_logger: Mutex<Option<JoinHandle<()>>>,
    interrupted: AtomicBool,
}

impl Orchestrator {
    /// Build every component against the real model endpoints, git and sandbox
    pub fn new(config: Config) -> Result<Self> {
        debug!(repo = ?config.target.repo_path, "Orchestrator::new: called");
        config.validate()?;
        let prompts = PromptLoader::new(config.prompts.dir.as_deref());
        let worker_prompt = prompts
            .render("worker", &PromptContext::from_config(&config))
            .context("Failed to render worker prompt")?;
        let llm: Arc<dyn LlmClient> =
            Arc::new(LlmRouter::from_config(&config.llm).context("Failed to build model router")?);
        let git: Arc<dyn GitRunner> = Arc::new(GitCli::new(&config.target.repo_path));
        let pool = Arc::new(WorkerPool::from_config(&config, worker_prompt)?);
        Self::with_parts(config, llm, git, pool, prompts)
    }

    /// Build from already-constructed collaborators
    pub fn with_parts(
        config: Config,
        llm: Arc<dyn LlmClient>,
        git: Arc<dyn GitRunner>,
        pool: Arc<WorkerPool>,
        prompts: PromptLoader,
    ) -> Result<Self> {
        debug!("Orchestrator::with_parts: called");
        let prompts = Arc::new(prompts);
        let events = Arc::new(EventBus::new(DEFAULT_CHANNEL_CAPACITY));
        let git_lock = new_git_lock();

        let queue = Arc::new(TaskQueue::new());
        let status_events = Arc::clone(&events);
        queue.add_observer(Arc::new(move |task: &Task, from: TaskStatus, to: TaskStatus| {
            status_events.emit(SwarmEvent::TaskStatus {
                task_id: task.id.clone(),
                from,
                to,
            });
        }));

        let merge = Arc::new(MergeQueue::new(
            Arc::clone(&git),
            git_lock.clone(),
            &config,
            Arc::clone(&events),
        ));
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            &config,
            Arc::clone(&events),
        ));

        let merge_monitor = Arc::clone(&monitor);
        merge.on_merge_result(Arc::new(move |result: &MergeResult| merge_monitor.record_merge(result)));
        merge.on_conflict(Arc::new(|branch: &str, files: &[String]| {
            warn!(%branch, ?files, "Branch abandoned after repeated conflicts");
        }));
        monitor.on_timeout(Arc::new(|task: &Task, elapsed_ms: i64| {
            warn!(task_id = %task.id, elapsed_ms, "Worker exceeded its timeout");
        }));

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            Arc::clone(&merge),
            Arc::clone(&monitor),
            Arc::clone(&events),
            config.workers.max_concurrent,
        ));
        let subplanner = Arc::new(Subplanner::new(
            Arc::clone(&llm),
            Arc::clone(&dispatcher),
            Arc::clone(&prompts),
            &config,
        ));
        let planner = Arc::new(Planner::new(
            Arc::clone(&llm),
            Arc::clone(&dispatcher),
            subplanner,
            Arc::clone(&git),
            &prompts,
            &config,
            Arc::clone(&events),
        )?);
        let reconciler = Arc::new(
            Reconciler::new(llm, git, git_lock, &prompts, &config, Arc::clone(&events))?
                .with_monitor(Arc::clone(&monitor)),
        );

        let fix_planner = Arc::clone(&planner);
        reconciler.on_fix_tasks(Arc::new(move |tasks: &[Task]| {
            for task in tasks {
                if !fix_planner.inject(task.clone()) {
                    warn!(task_id = %task.id, "Planner gone, fix task dropped");
                }
            }
        }));

        Ok(Self {
            config,
            events,
            queue,
            pool,
            merge,
            monitor,
            dispatcher,
            planner,
            reconciler,
            error_handlers: RwLock::new(Vec::new()),
            background: Mutex::new(Vec::new()),
            event_logger: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn merge_queue(&self) -> &Arc<MergeQueue> {
        &self.merge
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Register a handler for fatal component errors
    pub fn on_error(&self, handler: ErrorHandler) {
        self.error_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Ask a running `run` to wind down: stop planning, let in-flight work drain
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.interrupted.store(true, Ordering::SeqCst);
        self.planner.stop();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The event log writer, if one was started; it finishes once the
    /// orchestrator is dropped
    pub fn take_event_logger(&self) -> Option<JoinHandle<()>> {
        self.event_logger.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Start the event log and the background loops
    pub async fn start(&self) -> Result<()> {
        debug!("Orchestrator::start: called");
        if let Some(path) = &self.config.events.log_path {
            let handle = spawn_event_logger(&self.events, path)?;
            *self.event_logger.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
        self.pool.start().await;
        let handles = vec![self.merge.start(), self.monitor.start(), self.reconciler.start()];
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!(
            max_workers = self.config.workers.max_concurrent,
            strategy = %self.config.merge.strategy,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Stop the background loops and wait for them to exit
    pub async fn stop(&self) {
        debug!("Orchestrator::stop: called");
        self.planner.stop();
        self.merge.stop();
        self.monitor.stop();
        self.reconciler.stop();
        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.pool.stop().await;
    }

    /// Run one request end to end; the summary is emitted on every path
    pub async fn run(&self, request: &str) -> RunSummary {
        let started = Instant::now();
        let mut outcome = RunOutcome::Completed;
        let mut failure: Option<String> = None;
        let mut planner_iterations = 0;
        let mut finalization = Finalization::default();

        match self.start().await {
            Err(e) => {
                self.report_error("orchestrator", &e);
                outcome = RunOutcome::Aborted;
                failure = Some(format!("{:#}", e));
            }
            Ok(()) => match self.planner.run_loop(request).await {
                Err(e) => {
                    planner_iterations = self.planner.iterations();
                    self.report_error("planner", &e);
                    outcome = RunOutcome::Aborted;
                    failure = Some(format!("{:#}", e));
                }
                Ok(report) => {
                    planner_iterations = report.iterations;
                    info!(
                        iterations = report.iterations,
                        tasks = report.tasks_created,
                        handoffs = report.handoffs,
                        "Planning complete"
                    );
                    if self.is_interrupted() {
                        outcome = RunOutcome::Interrupted;
                    } else {
                        match self.finalize().await {
                            Ok(done) => finalization = done,
                            Err(e) => {
                                self.report_error("finalization", &e);
                                outcome = RunOutcome::Aborted;
                                failure = Some(format!("{:#}", e));
                            }
                        }
                    }
                }
            },
        }

        if outcome == RunOutcome::Aborted && self.is_interrupted() {
            outcome = RunOutcome::Interrupted;
        }
        self.stop().await;

        let summary = RunSummary {
            outcome,
            error: failure,
            metrics: self.monitor.snapshot(),
            merges: self.merge.stats(),
            planner_iterations,
            sweeps: finalization.sweeps,
            healthy: finalization.healthy,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            outcome = %summary.outcome,
            iterations = summary.planner_iterations,
            merged = summary.merges.merged,
            sweeps = summary.sweeps,
            healthy = ?summary.healthy,
            "Run finished"
        );
        self.events.emit(SwarmEvent::RunSummary(summary.clone()));
        summary
    }

    /// Drain merges and sweep until main is green or attempts run out
    pub async fn finalize(&self) -> Result<Finalization> {
        let max_attempts = self.config.finalization.max_attempts.max(1);
        debug!(max_attempts, "Orchestrator::finalize: called");
        self.merge.stop();
        self.reconciler.stop();

        let drained = self.merge.process_queue().await;
        info!(merges = drained.len(), "Merge queue drained");

        let mut result = Finalization::default();
        for attempt in 1..=max_attempts {
            if self.is_interrupted() {
                break;
            }
            let report = self
                .reconciler
                .sweep()
                .await
                .context(format!("Finalization sweep {} failed", attempt))?;
            result.sweeps += 1;
            result.healthy = Some(report.healthy);
            if report.healthy {
                info!(attempt, "Main is green");
                break;
            }
            if attempt == max_attempts {
                warn!(attempt, "Finalization attempts exhausted, main still unhealthy");
                break;
            }

            let handoffs = self.dispatch_fixes(report.fix_tasks).await;
            info!(attempt, fixes = handoffs.len(), "Fix tasks finished");
            self.merge.process_queue().await;
        }
        Ok(result)
    }

    /// Dispatch fix tasks directly, bypassing the planner
    async fn dispatch_fixes(&self, tasks: Vec<Task>) -> Vec<Handoff> {
        let mut accepted = Vec::new();
        for task in tasks {
            match self.dispatcher.register(task.clone()) {
                Ok(()) => accepted.push(task),
                Err(e) => warn!(task_id = %task.id, error = %e, "Fix task rejected"),
            }
        }
        join_all(accepted.iter().map(|task| self.dispatcher.dispatch_leaf(task, 0))).await
    }

    fn report_error(&self, component: &str, err: &eyre::Report) {
        error!(component, error = %format!("{:#}", err), "Component failed");
        self.events.emit_error(component, format!("{:#}", err));
        let handlers: Vec<ErrorHandler> = self
            .error_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(component, err);
        }
    }
}

/// Wait briefly for the event log to flush its last lines
pub async fn drain_event_logger(handle: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, handle).await.is_err() {
        debug!("drain_event_logger: timed out");
    }
}

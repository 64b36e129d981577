//! MergeQueue - serialized merging of task branches into main

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::git::{GitLock, GitOutput, GitRunner};
use crate::config::{Config, MergeStrategy};
use crate::domain::{FIX_PRIORITY, MergeStats};
use crate::events::{EventBus, SwarmEvent};

/// Outcome of one merge attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Landed on main and pushed
    Merged { strategy: MergeStrategy },
    /// Already in the merged set, nothing done
    Skipped,
    /// Conflicted; `retried` is false once the branch was escalated
    Conflict { files: Vec<String>, retried: bool },
    /// Anything else that went wrong
    Failed { message: String, retried: bool },
}

impl MergeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Merged { .. })
    }

    /// Counts toward merge attempts
    pub fn is_attempt(&self) -> bool {
        !matches!(self, Self::Skipped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Merged { .. } => "merged",
            Self::Skipped => "skipped",
            Self::Conflict { retried: true, .. } => "conflict-retry",
            Self::Conflict { retried: false, .. } => "conflict",
            Self::Failed { retried: true, .. } => "failed-retry",
            Self::Failed { retried: false, .. } => "failed",
        }
    }
}

/// Result reported to observers for every processed branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    pub branch: String,
    pub outcome: MergeOutcome,
}

impl MergeResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Called once when a branch exhausts its conflict retries
pub type ConflictHandler = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// Called after every merge attempt
pub type MergeResultHandler = Arc<dyn Fn(&MergeResult) + Send + Sync>;

#[derive(Debug, Clone)]
struct QueueEntry {
    branch: String,
    priority: u32,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

#[derive(Default)]
struct MergeState {
    entries: Vec<QueueEntry>,
    merged: HashSet<String>,
    retries: HashMap<String, u32>,
    stats: MergeStats,
    next_seq: u64,
}

impl MergeState {
    fn is_queued(&self, branch: &str) -> bool {
        self.entries.iter().any(|e| e.branch == branch)
    }

    fn push(&mut self, branch: &str, priority: u32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueueEntry {
            branch: branch.to_string(),
            priority,
            enqueued_at: Utc::now(),
            seq,
        });
    }

    /// Remove the most urgent entry: lowest priority, then oldest
    fn pop(&mut self) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .map(|(i, _)| i)?;
        Some(self.entries.remove(index))
    }
}

/// Strategy step failure
enum StrategyError {
    Conflict(Vec<String>),
    Other(String),
}

/// Merges completed task branches into main one at a time
///
/// Every git call happens while holding the shared git lock. The queue is
/// idempotent: a branch already queued or already merged is never added twice.
pub struct MergeQueue {
    git: Arc<dyn GitRunner>,
    git_lock: GitLock,
    strategy: MergeStrategy,
    main_branch: String,
    remote: String,
    max_conflict_retries: u32,
    interval: Duration,
    events: Arc<EventBus>,
    state: Mutex<MergeState>,
    /// Only one drain runs at a time
    draining: tokio::sync::Mutex<()>,
    conflict_handlers: RwLock<Vec<ConflictHandler>>,
    result_handlers: RwLock<Vec<MergeResultHandler>>,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl MergeQueue {
    pub fn new(git: Arc<dyn GitRunner>, git_lock: GitLock, config: &Config, events: Arc<EventBus>) -> Self {
        debug!(strategy = %config.merge.strategy, main = %config.git.main_branch, "MergeQueue::new: called");
        let (shutdown, _) = watch::channel(false);
        Self {
            git,
            git_lock,
            strategy: config.merge.strategy,
            main_branch: config.git.main_branch.clone(),
            remote: config.target.remote.clone(),
            max_conflict_retries: config.merge.max_conflict_retries,
            interval: Duration::from_millis(config.merge.interval_ms.max(1)),
            events,
            state: Mutex::new(MergeState::default()),
            draining: tokio::sync::Mutex::new(()),
            conflict_handlers: RwLock::new(Vec::new()),
            result_handlers: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    fn state(&self) -> MutexGuard<'_, MergeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the handler for branches that keep conflicting
    pub fn on_conflict(&self, handler: ConflictHandler) {
        self.conflict_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Register an observer for every merge result
    pub fn on_merge_result(&self, handler: MergeResultHandler) {
        self.result_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Queue a branch for merging
    ///
    /// Returns false (and changes nothing) if the branch is already queued or
    /// already merged.
    pub fn enqueue(&self, branch: &str, priority: u32) -> bool {
        debug!(%branch, priority, "MergeQueue::enqueue: called");
        let mut state = self.state();
        if state.merged.contains(branch) || state.is_queued(branch) {
            debug!(%branch, "MergeQueue::enqueue: already queued or merged");
            return false;
        }
        state.push(branch, priority);
        info!(%branch, queue_len = state.entries.len(), "Branch queued for merge");
        true
    }

    pub fn queue_len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_queued(&self, branch: &str) -> bool {
        self.state().is_queued(branch)
    }

    pub fn is_merged(&self, branch: &str) -> bool {
        self.state().merged.contains(branch)
    }

    pub fn conflict_retries(&self, branch: &str) -> u32 {
        self.state().retries.get(branch).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> MergeStats {
        self.state().stats
    }

    /// Drain the queue now, including branches re-queued during the drain
    pub async fn process_queue(&self) -> Vec<MergeResult> {
        debug!("MergeQueue::process_queue: called");
        let _drain = self.draining.lock().await;
        let mut results = Vec::new();
        loop {
            let entry = self.state().pop();
            let Some(entry) = entry else {
                break;
            };
            let result = self.merge_branch(&entry.branch, entry.priority).await;
            results.push(result);
        }
        results
    }

    /// Start draining on a fixed interval in the background
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        debug!(interval_ms = self.interval.as_millis() as u64, "MergeQueue::start: called");
        self.running.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(false);
        let queue = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if queue.queue_len() > 0 {
                            queue.process_queue().await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("MergeQueue: background loop stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop the background loop; an in-progress merge finishes first
    pub fn stop(&self) {
        debug!("MergeQueue::stop: called");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn remote_ref(&self, branch: &str) -> String {
        format!("{}/{}", self.remote, branch)
    }

    async fn git(&self, args: &[&str]) -> GitOutput {
        match self.git.run(args).await {
            Ok(output) => output,
            Err(e) => GitOutput::failed("", e.to_string()),
        }
    }

    /// Files with unresolved conflicts in the working tree
    async fn conflicted_files(&self) -> Vec<String> {
        self.git(&["diff", "--name-only", "--diff-filter=U"]).await.lines()
    }

    /// Merge `source` into main with a merge commit
    async fn merge_commit(&self, branch: &str, source: &str) -> Result<(), StrategyError> {
        let message = format!("Merge branch '{}'", branch);
        let output = self.git(&["merge", "--no-ff", "-m", &message, source]).await;
        if output.success {
            return Ok(());
        }
        if output.is_conflict() {
            let files = self.conflicted_files().await;
            self.git(&["merge", "--abort"]).await;
            return Err(StrategyError::Conflict(files));
        }
        self.git(&["merge", "--abort"]).await;
        Err(StrategyError::Other(output.combined()))
    }

    /// Rebase the branch onto main, then fast-forward main to it
    async fn rebase_and_fast_forward(&self, branch: &str, source: &str) -> Result<(), StrategyError> {
        let checkout = self.git(&["checkout", "-B", branch, source]).await;
        if !checkout.success {
            self.git(&["checkout", &self.main_branch]).await;
            return Err(StrategyError::Other(checkout.combined()));
        }

        let rebase = self.git(&["rebase", &self.main_branch]).await;
        let result = if rebase.success {
            self.git(&["checkout", &self.main_branch]).await;
            let ff = self.git(&["merge", "--ff-only", branch]).await;
            if ff.success {
                Ok(())
            } else {
                Err(StrategyError::Other(ff.combined()))
            }
        } else {
            let conflict = rebase.is_conflict();
            let files = if conflict { self.conflicted_files().await } else { Vec::new() };
            self.git(&["rebase", "--abort"]).await;
            self.git(&["checkout", &self.main_branch]).await;
            if conflict {
                Err(StrategyError::Conflict(files))
            } else {
                Err(StrategyError::Other(rebase.combined()))
            }
        };
        self.drop_local_branch(branch).await;
        result
    }

    /// Delete the local copy of a task branch; main must be checked out
    async fn drop_local_branch(&self, branch: &str) {
        let output = self.git(&["branch", "-D", branch]).await;
        if !output.success {
            debug!(%branch, "MergeQueue::drop_local_branch: delete failed, ignoring");
        }
    }

    async fn attempt(&self, strategy: MergeStrategy, branch: &str, source: &str) -> Result<(), StrategyError> {
        debug!(%branch, %strategy, "MergeQueue::attempt: called");
        match strategy {
            MergeStrategy::FastForward => {
                let output = self.git(&["merge", "--ff-only", source]).await;
                if output.success {
                    Ok(())
                } else {
                    Err(StrategyError::Other(output.combined()))
                }
            }
            MergeStrategy::Rebase => self.rebase_and_fast_forward(branch, source).await,
            MergeStrategy::MergeCommit => self.merge_commit(branch, source).await,
        }
    }

    /// Rebase a conflicting branch onto main and force-push it for the next try
    async fn rebase_branch_for_retry(&self, branch: &str) {
        let source = self.remote_ref(branch);
        let checkout = self.git(&["checkout", "-B", branch, &source]).await;
        if checkout.success {
            let rebase = self.git(&["rebase", &self.main_branch]).await;
            if rebase.success {
                let push = self.git(&["push", "--force-with-lease", &self.remote, branch]).await;
                if !push.success {
                    warn!(%branch, error = %push.combined(), "Failed to push rebased branch");
                }
            } else {
                debug!(%branch, "MergeQueue::rebase_branch_for_retry: rebase failed, aborting");
                self.git(&["rebase", "--abort"]).await;
            }
        }
        self.git(&["checkout", &self.main_branch]).await;
        if checkout.success {
            self.drop_local_branch(branch).await;
        }
    }

    /// Bump the retry counter if the budget allows; returns whether to retry
    fn take_retry(&self, branch: &str) -> bool {
        let mut state = self.state();
        let used = state.retries.get(branch).copied().unwrap_or(0);
        if used < self.max_conflict_retries {
            state.retries.insert(branch.to_string(), used + 1);
            state.stats.retries += 1;
            true
        } else {
            false
        }
    }

    fn requeue(&self, branch: &str) {
        let mut state = self.state();
        if !state.is_queued(branch) && !state.merged.contains(branch) {
            state.push(branch, FIX_PRIORITY);
        }
    }

    /// Run the full merge protocol for one branch
    pub async fn merge_branch(&self, branch: &str, priority: u32) -> MergeResult {
        debug!(%branch, priority, "MergeQueue::merge_branch: called");
        if self.is_merged(branch) {
            debug!(%branch, "MergeQueue::merge_branch: already merged, skipping");
            return MergeResult {
                branch: branch.to_string(),
                outcome: MergeOutcome::Skipped,
            };
        }

        let outcome = {
            let _guard = self.git_lock.lock().await;
            self.state().stats.attempts += 1;
            self.run_protocol(branch).await
        };

        let result = MergeResult {
            branch: branch.to_string(),
            outcome,
        };
        self.report(&result);
        result
    }

    async fn run_protocol(&self, branch: &str) -> MergeOutcome {
        let source = self.remote_ref(branch);

        let fetch = self.git(&["fetch", &self.remote, branch]).await;
        if !fetch.success {
            return self.fail(branch, format!("fetch failed: {}", fetch.combined()), false);
        }
        let checkout = self.git(&["checkout", &self.main_branch]).await;
        if !checkout.success {
            return self.fail(branch, format!("checkout {} failed: {}", self.main_branch, checkout.combined()), false);
        }

        let mut strategy = self.strategy;
        let mut attempt = self.attempt(strategy, branch, &source).await;
        if strategy != MergeStrategy::MergeCommit {
            if let Err(StrategyError::Other(reason)) = &attempt {
                info!(%branch, from = %strategy, reason = %reason.lines().next().unwrap_or_default(), "Falling back to merge-commit");
                strategy = MergeStrategy::MergeCommit;
                attempt = self.attempt(strategy, branch, &source).await;
            }
        }

        match attempt {
            Ok(()) => self.publish(branch, strategy).await,
            Err(StrategyError::Conflict(files)) => self.handle_conflict(branch, files).await,
            Err(StrategyError::Other(reason)) => self.fail(branch, reason, false),
        }
    }

    async fn publish(&self, branch: &str, strategy: MergeStrategy) -> MergeOutcome {
        let push = self.git(&["push", &self.remote, &self.main_branch]).await;
        if !push.success {
            warn!(%branch, error = %push.combined(), "Push of main failed, resetting to remote");
            let remote_main = self.remote_ref(&self.main_branch);
            self.git(&["fetch", &self.remote, &self.main_branch]).await;
            self.git(&["reset", "--hard", &remote_main]).await;
            let retried = self.take_retry(branch);
            if retried {
                self.requeue(branch);
            }
            return self.fail(branch, format!("push failed: {}", push.combined()), retried);
        }

        {
            let mut state = self.state();
            state.merged.insert(branch.to_string());
            state.retries.remove(branch);
            state.stats.merged += 1;
        }

        let delete = self.git(&["push", &self.remote, "--delete", branch]).await;
        if !delete.success {
            debug!(%branch, "MergeQueue::publish: remote branch delete failed, ignoring");
        }

        info!(%branch, %strategy, "Branch merged");
        MergeOutcome::Merged { strategy }
    }

    async fn handle_conflict(&self, branch: &str, files: Vec<String>) -> MergeOutcome {
        self.state().stats.conflicts += 1;

        if self.take_retry(branch) {
            info!(%branch, attempt = self.conflict_retries(branch), ?files, "Merge conflict, rebasing and retrying");
            self.rebase_branch_for_retry(branch).await;
            self.requeue(branch);
            return MergeOutcome::Conflict { files, retried: true };
        }

        warn!(%branch, ?files, "Merge conflict retries exhausted, escalating");
        self.state().stats.escalated += 1;
        let handlers = self
            .conflict_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(branch, &files);
        }
        MergeOutcome::Conflict { files, retried: false }
    }

    fn fail(&self, branch: &str, message: String, retried: bool) -> MergeOutcome {
        warn!(%branch, %message, retried, "Merge failed");
        if !retried {
            self.state().stats.failed += 1;
        }
        MergeOutcome::Failed { message, retried }
    }

    fn report(&self, result: &MergeResult) {
        let conflicts = match &result.outcome {
            MergeOutcome::Conflict { files, .. } => files.clone(),
            _ => Vec::new(),
        };
        self.events.emit(SwarmEvent::MergeResult {
            branch: result.branch.clone(),
            success: result.is_success(),
            status: result.outcome.label().to_string(),
            conflicts,
        });

        let handlers = self
            .result_handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::git::testing::ScriptedGit;
    use super::super::git::{GitCli, new_git_lock};
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicUsize;
    use tokio::process::Command;

    fn config(strategy: MergeStrategy) -> Config {
        let mut config = Config::default();
        config.merge.strategy = strategy;
        config.merge.max_conflict_retries = 2;
        config
    }

    fn queue_with(git: Arc<ScriptedGit>, strategy: MergeStrategy) -> MergeQueue {
        MergeQueue::new(git, new_git_lock(), &config(strategy), Arc::new(EventBus::new(64)))
    }

    fn conflict() -> GitOutput {
        GitOutput::failed("CONFLICT (content): Merge conflict in src/lib.rs", "")
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let queue = queue_with(Arc::new(ScriptedGit::new()), MergeStrategy::FastForward);
        assert!(queue.enqueue("worker/a", 5));
        assert!(!queue.enqueue("worker/a", 1));
        assert_eq!(queue.queue_len(), 1);
        assert!(queue.is_queued("worker/a"));
    }

    #[tokio::test]
    async fn test_merged_branch_is_not_requeued() {
        let git = Arc::new(ScriptedGit::new());
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);
        queue.enqueue("worker/a", 5);

        let results = queue.process_queue().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_success());
        assert!(queue.is_merged("worker/a"));
        assert!(!queue.enqueue("worker/a", 5));

        assert_eq!(
            queue.merge_branch("worker/a", 5).await.outcome,
            MergeOutcome::Skipped
        );
        assert_eq!(queue.stats().attempts, 1);
        assert_eq!(queue.stats().merged, 1);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let git = Arc::new(ScriptedGit::new());
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);
        queue.enqueue("worker/normal", 5);
        queue.enqueue("worker/urgent", 1);
        queue.enqueue("worker/later", 5);

        let order: Vec<String> = queue.process_queue().await.into_iter().map(|r| r.branch).collect();
        assert_eq!(order, vec!["worker/urgent", "worker/normal", "worker/later"]);
    }

    #[tokio::test]
    async fn test_fast_forward_falls_back_to_merge_commit() {
        let git = Arc::new(ScriptedGit::new().on(
            &["merge", "--ff-only"],
            GitOutput::failed("", "fatal: Not possible to fast-forward, aborting."),
        ));
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);
        queue.enqueue("worker/a", 5);

        let results = queue.process_queue().await;
        assert_eq!(
            results[0].outcome,
            MergeOutcome::Merged {
                strategy: MergeStrategy::MergeCommit
            }
        );
        assert_eq!(git.count("merge --no-ff"), 1);
        assert!(git.called("push origin main"));
        assert!(git.called("push origin --delete worker/a"));
    }

    #[tokio::test]
    async fn test_conflict_retries_then_escalates_once() {
        let git = Arc::new(
            ScriptedGit::new()
                .on(&["merge", "--ff-only"], GitOutput::failed("", "fatal: Not possible to fast-forward"))
                .on(&["merge", "--no-ff"], conflict())
                .on(&["diff", "--name-only"], GitOutput::ok("src/lib.rs\n"))
                .on(&["rebase", "main"], GitOutput::failed("", "error: could not apply abc123"))
        );
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);

        let escalations = Arc::new(Mutex::new(Vec::new()));
        let seen = escalations.clone();
        queue.on_conflict(Arc::new(move |branch: &str, files: &[String]| {
            seen.lock().unwrap().push((branch.to_string(), files.to_vec()));
        }));
        let results_seen = Arc::new(AtomicUsize::new(0));
        let counter = results_seen.clone();
        queue.on_merge_result(Arc::new(move |_: &MergeResult| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        queue.enqueue("worker/a", 5);
        let results = queue.process_queue().await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].outcome.label(), "conflict-retry");
        assert_eq!(results[1].outcome.label(), "conflict-retry");
        assert_eq!(results[2].outcome.label(), "conflict");
        assert_eq!(results_seen.load(Ordering::SeqCst), 3);

        let escalations = escalations.lock().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].0, "worker/a");
        assert_eq!(escalations[0].1, vec!["src/lib.rs".to_string()]);

        assert_eq!(queue.conflict_retries("worker/a"), 2);
        assert!(!queue.is_merged("worker/a"));
        assert_eq!(queue.queue_len(), 0);

        let stats = queue.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.conflicts, 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.escalated, 1);
        assert_eq!(stats.merged, 0);
        assert_eq!(git.count("merge --abort"), 3);
        assert_eq!(git.count("rebase --abort"), 2);
    }

    #[tokio::test]
    async fn test_push_failure_resets_main_and_retries() {
        let git = Arc::new(ScriptedGit::new().on(&["push", "origin", "main"], GitOutput::failed("", "rejected")));
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);
        queue.enqueue("worker/a", 5);

        let results = queue.process_queue().await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].outcome.label(), "failed-retry");
        assert_eq!(results[2].outcome.label(), "failed");
        assert_eq!(git.count("reset --hard origin/main"), 3);
        assert!(!queue.is_merged("worker/a"));
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_merge_results_are_emitted() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let queue = MergeQueue::new(
            Arc::new(ScriptedGit::new()),
            new_git_lock(),
            &config(MergeStrategy::FastForward),
            events,
        );
        queue.enqueue("worker/a", 5);
        queue.process_queue().await;

        match rx.recv().await.unwrap() {
            SwarmEvent::MergeResult { branch, success, status, .. } => {
                assert_eq!(branch, "worker/a");
                assert!(success);
                assert_eq!(status, "merged");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_background_loop_stops() {
        let mut config = config(MergeStrategy::FastForward);
        config.merge.interval_ms = 10;
        let queue = Arc::new(MergeQueue::new(
            Arc::new(ScriptedGit::new()),
            new_git_lock(),
            &config,
            Arc::new(EventBus::new(16)),
        ));
        let handle = queue.start();
        assert!(queue.is_running());
        queue.enqueue("worker/a", 5);

        for _ in 0..100 {
            if queue.is_merged("worker/a") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_merged("worker/a"));

        queue.stop();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(!queue.is_running());
    }

    async fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git").args(args).current_dir(dir).output().await.unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    async fn setup_git_repo(dir: &Path) {
        git(dir, &["init", "-q", "-b", "main"]).await;
        git(dir, &["config", "user.email", "test@test.com"]).await;
        git(dir, &["config", "user.name", "Test"]).await;
        git(dir, &["config", "commit.gpgsign", "false"]).await;
        git(dir, &["commit", "--allow-empty", "-m", "initial"]).await;
    }

    /// Bare `origin` plus a working clone with one commit on main
    async fn remote_fixture(root: &Path) -> (PathBuf, PathBuf) {
        let remote = root.join("remote.git");
        let work = root.join("work");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        git(&remote, &["init", "-q", "--bare", "-b", "main"]).await;
        setup_git_repo(&work).await;
        git(&work, &["remote", "add", "origin", remote.to_str().unwrap()]).await;
        git(&work, &["push", "-q", "origin", "main"]).await;
        (remote, work)
    }

    async fn commit_file(dir: &Path, name: &str, message: &str) {
        std::fs::write(dir.join(name), format!("{}\n", message)).unwrap();
        git(dir, &["add", name]).await;
        git(dir, &["commit", "-q", "-m", message]).await;
    }

    /// Push a one-commit task branch, then move main ahead of it
    async fn diverge(work: &Path, branch: &str) {
        git(work, &["checkout", "-q", "-b", branch]).await;
        commit_file(work, "x.txt", "x").await;
        git(work, &["push", "-q", "origin", branch]).await;
        git(work, &["checkout", "-q", "main"]).await;
        git(work, &["branch", "-q", "-D", branch]).await;

        commit_file(work, "m.txt", "m").await;
        git(work, &["push", "-q", "origin", "main"]).await;
    }

    fn real_queue(work: &Path, strategy: MergeStrategy) -> MergeQueue {
        MergeQueue::new(
            Arc::new(GitCli::new(work)),
            new_git_lock(),
            &config(strategy),
            Arc::new(EventBus::new(16)),
        )
    }

    async fn subjects(repo: &Path) -> Vec<String> {
        GitCli::new(repo)
            .run_ok(&["log", "--format=%s", "main"])
            .await
            .unwrap()
            .lines()
    }

    async fn has_branch(repo: &Path, branch: &str) -> bool {
        let listed = GitCli::new(repo).run_ok(&["branch", "--list", branch]).await.unwrap();
        !listed.stdout.trim().is_empty()
    }

    #[tokio::test]
    async fn test_fast_forward_against_real_remote() {
        let temp = tempfile::tempdir().unwrap();
        let (remote, work) = remote_fixture(temp.path()).await;

        git(&work, &["checkout", "-q", "-b", "worker/feature"]).await;
        commit_file(&work, "feature.txt", "add feature").await;
        git(&work, &["push", "-q", "origin", "worker/feature"]).await;
        git(&work, &["checkout", "-q", "main"]).await;
        git(&work, &["branch", "-q", "-D", "worker/feature"]).await;

        let queue = real_queue(&work, MergeStrategy::FastForward);
        queue.enqueue("worker/feature", 5);
        let results = queue.process_queue().await;

        assert_eq!(
            results[0].outcome,
            MergeOutcome::Merged {
                strategy: MergeStrategy::FastForward
            }
        );
        assert!(work.join("feature.txt").exists());
        assert!(subjects(&remote).await.contains(&"add feature".to_string()));
        assert!(!has_branch(&remote, "worker/feature").await);
    }

    #[tokio::test]
    async fn test_rebase_strategy_linearizes_diverged_branch() {
        let temp = tempfile::tempdir().unwrap();
        let (remote, work) = remote_fixture(temp.path()).await;
        diverge(&work, "worker/x").await;

        let queue = real_queue(&work, MergeStrategy::Rebase);
        queue.enqueue("worker/x", 5);
        let results = queue.process_queue().await;

        assert_eq!(
            results[0].outcome,
            MergeOutcome::Merged {
                strategy: MergeStrategy::Rebase
            }
        );
        assert_eq!(subjects(&remote).await, vec!["x", "m", "initial"]);
        assert!(work.join("x.txt").exists());
        assert!(work.join("m.txt").exists());
        assert!(!has_branch(&remote, "worker/x").await);
        assert!(!has_branch(&work, "worker/x").await);
    }

    #[tokio::test]
    async fn test_merge_commit_strategy_joins_diverged_branch() {
        let temp = tempfile::tempdir().unwrap();
        let (remote, work) = remote_fixture(temp.path()).await;
        diverge(&work, "worker/y").await;

        let queue = real_queue(&work, MergeStrategy::MergeCommit);
        queue.enqueue("worker/y", 5);
        let results = queue.process_queue().await;

        assert_eq!(
            results[0].outcome,
            MergeOutcome::Merged {
                strategy: MergeStrategy::MergeCommit
            }
        );
        let history = subjects(&remote).await;
        assert_eq!(history[0], "Merge branch 'worker/y'");
        assert!(history.contains(&"x".to_string()));
        assert!(history.contains(&"m".to_string()));

        let merges = GitCli::new(&remote)
            .run_ok(&["rev-list", "--merges", "--count", "main"])
            .await
            .unwrap();
        assert_eq!(merges.stdout.trim(), "1");
        assert!(!has_branch(&remote, "worker/y").await);
        assert!(!has_branch(&work, "worker/y").await);
    }

    #[tokio::test]
    async fn test_conflict_retry_leaves_no_local_branch() {
        let git = Arc::new(
            ScriptedGit::new()
                .on(&["merge", "--ff-only"], GitOutput::failed("", "fatal: Not possible to fast-forward"))
                .on(&["merge", "--no-ff"], conflict()),
        );
        let queue = queue_with(git.clone(), MergeStrategy::FastForward);
        queue.enqueue("worker/a", 5);

        let results = queue.process_queue().await;

        assert_eq!(results[0].outcome.label(), "conflict-retry");
        assert!(git.called("push --force-with-lease origin worker/a"));
        assert!(git.called("branch -D worker/a"));
    }
}

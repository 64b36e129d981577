//! AgentSwarm configuration types and loading
//!
//! Configuration is read from YAML (explicit path, `./.swarm.yml`, then the
//! user config dir), overridden by `SWARM_*` environment variables, and
//! validated once at startup. The resulting `Config` is passed by reference
//! into every component; nothing reads it from a global.

use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::domain::MAX_FIX_TASKS;

/// Main AgentSwarm configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Repository the swarm works on
    pub target: TargetConfig,

    /// Planning model endpoints
    pub llm: LlmConfig,

    /// Worker dispatch
    pub workers: WorkerConfig,

    /// Branch naming
    pub git: GitConfig,

    /// Merge queue
    pub merge: MergeConfig,

    pub planner: PlannerConfig,

    pub subplanner: SubplannerConfig,

    /// Build/test health sweeps
    pub reconciler: ReconcilerConfig,

    pub finalization: FinalizationConfig,

    pub monitor: MonitorConfig,

    pub prompts: PromptsConfig,

    pub events: EventsConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .swarm.yml
        let local_config = PathBuf::from(".swarm.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/agentswarm/swarm.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentswarm").join("swarm.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply `SWARM_*` environment overrides
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        debug!("Config::apply_env_overrides: called");

        if let Some(v) = lookup("SWARM_MAX_WORKERS") {
            self.workers.max_concurrent = parse_env("SWARM_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("SWARM_WORKER_TIMEOUT_SECS") {
            self.workers.timeout_secs = parse_env("SWARM_WORKER_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("SWARM_SANDBOX_COMMAND") {
            self.workers.mode = SandboxMode::Subprocess;
            self.workers.command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("SWARM_SANDBOX_URL") {
            self.workers.mode = SandboxMode::Http;
            self.workers.url = Some(v);
        }
        if let Some(v) = lookup("SWARM_MERGE_STRATEGY") {
            self.merge.strategy = v.parse().map_err(|e: String| eyre!(e))?;
        }
        if let Some(v) = lookup("SWARM_LLM_ENDPOINTS") {
            self.llm.endpoints = parse_endpoints(&v)?;
        }
        if let Some(v) = lookup("SWARM_LLM_API_KEY") {
            for endpoint in &mut self.llm.endpoints {
                if endpoint.api_key.is_none() {
                    endpoint.api_key = Some(v.clone());
                }
            }
        }
        if let Some(v) = lookup("SWARM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("SWARM_MAX_TOKENS") {
            self.llm.max_tokens = parse_env("SWARM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = lookup("SWARM_TEMPERATURE") {
            self.llm.temperature = parse_env("SWARM_TEMPERATURE", &v)?;
        }
        if let Some(v) = lookup("SWARM_MAIN_BRANCH") {
            self.git.main_branch = v;
        }
        if let Some(v) = lookup("SWARM_BRANCH_PREFIX") {
            self.git.branch_prefix = v;
        }
        if let Some(v) = lookup("SWARM_TARGET_REPO") {
            self.target.repo_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SWARM_REPO_URL") {
            self.target.repo_url = Some(v);
        }
        if let Some(v) = lookup("SWARM_HEALTH_CHECK_INTERVAL_SECS") {
            self.reconciler.interval_secs = parse_env("SWARM_HEALTH_CHECK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("SWARM_FINALIZATION_MAX_ATTEMPTS") {
            self.finalization.max_attempts = parse_env("SWARM_FINALIZATION_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("SWARM_BUILD_COMMAND") {
            self.reconciler.build_command = Some(v);
        }
        if let Some(v) = lookup("SWARM_TEST_COMMAND") {
            self.reconciler.test_command = Some(v);
        }

        Ok(())
    }

    /// Validate configuration before use
    ///
    /// Reports every problem at once so startup fails fast with a complete list.
    pub fn validate(&self) -> Result<()> {
        debug!("Config::validate: called");
        let mut problems = Vec::new();

        if self.workers.max_concurrent == 0 {
            problems.push("workers.max-concurrent must be at least 1".to_string());
        }
        if self.workers.timeout_secs == 0 {
            problems.push("workers.timeout-secs must be greater than 0".to_string());
        }
        match self.workers.mode {
            SandboxMode::Subprocess if self.workers.command.is_empty() => {
                problems.push("workers.command is required in subprocess mode (or set SWARM_SANDBOX_COMMAND)".into());
            }
            SandboxMode::Http if self.workers.url.as_deref().is_none_or(str::is_empty) => {
                problems.push("workers.url is required in http mode (or set SWARM_SANDBOX_URL)".into());
            }
            _ => {}
        }

        if self.llm.endpoints.is_empty() {
            problems.push("at least one llm endpoint is required (or set SWARM_LLM_ENDPOINTS)".to_string());
        }
        for endpoint in &self.llm.endpoints {
            if endpoint.base_url.trim().is_empty() {
                problems.push(format!("llm endpoint '{}' has no base-url", endpoint.name));
            }
            if endpoint.weight == 0 {
                problems.push(format!("llm endpoint '{}' must have weight > 0", endpoint.name));
            }
        }
        if self.llm.model.trim().is_empty() {
            problems.push("llm.model is required".to_string());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            problems.push(format!("llm.temperature {} is outside 0.0..=2.0", self.llm.temperature));
        }

        if !self.target.repo_path.is_dir() {
            problems.push(format!(
                "target.repo-path {} is not a directory",
                self.target.repo_path.display()
            ));
        }
        if self.git.main_branch.trim().is_empty() {
            problems.push("git.main-branch is required".to_string());
        }
        if self.subplanner.max_depth == 0 {
            problems.push("subplanner.max-depth must be at least 1".to_string());
        }
        if !(1..=MAX_FIX_TASKS).contains(&self.reconciler.max_fix_tasks) {
            problems.push(format!(
                "reconciler.max-fix-tasks {} is outside 1..={}",
                self.reconciler.max_fix_tasks, MAX_FIX_TASKS
            ));
        }
        if self.finalization.max_attempts == 0 {
            problems.push("finalization.max-attempts must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(eyre!("Invalid configuration:\n  - {}", problems.join("\n  - ")))
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| eyre!("Invalid value for {}: '{}'", name, value))
}

/// Parse `name=url@weight,name2=url2` into endpoints (weight defaults to 1)
pub fn parse_endpoints(value: &str) -> Result<Vec<LlmEndpoint>> {
    let mut endpoints = Vec::new();
    for (i, part) in value.split(',').map(str::trim).filter(|p| !p.is_empty()).enumerate() {
        let (name, rest) = match part.split_once('=') {
            Some((name, rest)) => (name.trim().to_string(), rest.trim()),
            None => (format!("endpoint-{}", i + 1), part),
        };
        let (base_url, weight) = match rest.rsplit_once('@') {
            Some((url, weight)) => (url.trim(), parse_env::<u32>("SWARM_LLM_ENDPOINTS weight", weight)?),
            None => (rest, 1),
        };
        endpoints.push(LlmEndpoint {
            name,
            base_url: base_url.to_string(),
            api_key: None,
            api_key_env: None,
            weight,
        });
    }
    Ok(endpoints)
}

/// Repository the swarm operates on
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Local working copy the merge queue and reconciler operate in
    #[serde(rename = "repo-path")]
    pub repo_path: PathBuf,

    /// Clone URL handed to workers
    #[serde(rename = "repo-url", skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,

    /// Git remote name
    pub remote: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            repo_url: None,
            remote: "origin".to_string(),
        }
    }
}

/// One OpenAI-compatible model endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmEndpoint {
    pub name: String,

    #[serde(rename = "base-url")]
    pub base_url: String,

    #[serde(rename = "api-key", default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    #[serde(rename = "api-key-env", default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Relative share of requests routed here
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl LlmEndpoint {
    /// Resolve the API key: inline value first, then the named env var
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| self.api_key_env.as_ref().and_then(|var| std::env::var(var).ok()))
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoints: Vec<LlmEndpoint>,

    /// Model identifier
    pub model: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    pub temperature: f32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            model: "glm-5".to_string(),
            max_tokens: 16384,
            temperature: 0.7,
            timeout_ms: 300_000,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// How execution units are reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    /// Spawn a local command per task
    #[default]
    Subprocess,
    /// POST to a sandbox HTTP server
    Http,
}

/// Worker dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum simultaneously outstanding dispatches
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    /// Per-worker ceiling in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,

    pub mode: SandboxMode,

    /// Program and arguments for subprocess mode
    pub command: Vec<String>,

    /// Base URL for http mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            timeout_secs: 1800,
            mode: SandboxMode::Subprocess,
            command: Vec::new(),
            url: None,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Git branch naming
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    #[serde(rename = "main-branch")]
    pub main_branch: String,

    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            branch_prefix: "worker/".to_string(),
        }
    }
}

/// Strategy used to land a task branch on main
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    FastForward,
    Rebase,
    MergeCommit,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FastForward => write!(f, "fast-forward"),
            Self::Rebase => write!(f, "rebase"),
            Self::MergeCommit => write!(f, "merge-commit"),
        }
    }
}

impl std::str::FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast-forward" | "ff" => Ok(Self::FastForward),
            "rebase" => Ok(Self::Rebase),
            "merge-commit" | "merge" => Ok(Self::MergeCommit),
            _ => Err(format!(
                "Unknown merge strategy: '{}'. Supported: fast-forward, rebase, merge-commit",
                s
            )),
        }
    }
}

/// Merge queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,

    /// Rebase-and-retry attempts before a conflict is escalated
    #[serde(rename = "max-conflict-retries")]
    pub max_conflict_retries: u32,

    /// Background drain interval in milliseconds
    #[serde(rename = "interval-ms")]
    pub interval_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::FastForward,
            max_conflict_retries: 2,
            interval_ms: 5_000,
        }
    }
}

/// Top-level planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Handoffs to accumulate before re-planning
    #[serde(rename = "min-handoffs")]
    pub min_handoffs: usize,

    /// Consecutive failed model calls before the loop aborts
    #[serde(rename = "max-consecutive-failures")]
    pub max_consecutive_failures: u32,

    /// Conversation size (characters) that triggers compaction
    #[serde(rename = "history-char-budget")]
    pub history_char_budget: usize,

    /// Exchanges kept verbatim after compaction
    #[serde(rename = "keep-recent-exchanges")]
    pub keep_recent_exchanges: usize,

    /// Continuation requests for a truncated response
    #[serde(rename = "max-continuations")]
    pub max_continuations: u32,

    /// Hard cap on planning iterations
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Idle wait between loop checks in milliseconds
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Files listed in the repository snapshot
    #[serde(rename = "max-snapshot-files")]
    pub max_snapshot_files: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            min_handoffs: 3,
            max_consecutive_failures: 10,
            history_char_budget: 200_000,
            keep_recent_exchanges: 4,
            max_continuations: 3,
            max_iterations: 500,
            poll_interval_ms: 1_000,
            max_snapshot_files: 400,
        }
    }
}

/// Recursive decomposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubplannerConfig {
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Minimum scope size that warrants decomposition
    #[serde(rename = "scope-threshold")]
    pub scope_threshold: usize,

    /// Cap on planning rounds per parent
    #[serde(rename = "max-rounds")]
    pub max_rounds: u32,

    #[serde(rename = "max-consecutive-failures")]
    pub max_consecutive_failures: u32,
}

impl Default for SubplannerConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            scope_threshold: 4,
            max_rounds: 20,
            max_consecutive_failures: 5,
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    #[serde(rename = "build-command", skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    #[serde(rename = "test-command", skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,

    /// Health-check interval in seconds
    #[serde(rename = "interval-secs")]
    pub interval_secs: u64,

    #[serde(rename = "max-fix-tasks")]
    pub max_fix_tasks: usize,

    #[serde(rename = "command-timeout-secs")]
    pub command_timeout_secs: u64,

    /// Characters of failure output sent to the fix planner
    #[serde(rename = "max-output-chars")]
    pub max_output_chars: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            build_command: None,
            test_command: None,
            interval_secs: 300,
            max_fix_tasks: 5,
            command_timeout_secs: 600,
            max_output_chars: 8_000,
        }
    }
}

/// Finalization phase configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalizationConfig {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
}

impl Default for FinalizationConfig {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(rename = "poll-interval-secs")]
    pub poll_interval_secs: u64,

    /// Estimated spend per million tokens, in dollars
    #[serde(rename = "cost-per-million-tokens")]
    pub cost_per_million_tokens: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 15,
            cost_per_million_tokens: 1.0,
        }
    }
}

/// Prompt template overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Directory containing `{name}.md` overrides
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Event log configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// JSONL event log; disabled when unset
    #[serde(rename = "log-path", skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

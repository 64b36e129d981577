//! AgentSwarm CLI entry point

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use agentswarm::cli::{Cli, Command, ConfigCommand, get_log_path, parse_level};
use agentswarm::config::Config;
use agentswarm::domain::{RunOutcome, RunSummary};
use agentswarm::orchestrator::{Orchestrator, drain_event_logger};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, to_stderr: bool) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => parse_level(s).unwrap_or_else(|| {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }),
        None => tracing::Level::INFO,
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    if to_stderr {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter)
            .init();
    } else {
        let log_path = get_log_path();
        let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let log_file = fs::File::create(&log_path).context("Failed to create log file")?;
        tracing_subscriber::fmt()
            .with_writer(log_file)
            .with_ansi(false)
            .with_env_filter(filter)
            .init();
    }

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let mut config = Config::load(path).context("Failed to load configuration")?;
    config
        .apply_env_overrides(|key| std::env::var(key).ok())
        .context("Failed to apply environment overrides")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), cli.log_stderr)
        .context("Failed to setup logging")?;

    let config = load_config(cli.config.as_ref())?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run { request } => cmd_run(config, &request).await,
        Command::Config {
            command: ConfigCommand::Check,
        } => cmd_config_check(&config),
    }
}

/// Validate the resolved configuration and print it
fn cmd_config_check(config: &Config) -> Result<()> {
    debug!("cmd_config_check: called");
    config.validate()?;
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("{}", yaml.trim_end());
    println!("{}", "Configuration OK".green());
    Ok(())
}

/// Run a request to completion, honoring Ctrl-C
async fn cmd_run(config: Config, request: &str) -> Result<()> {
    debug!(request_chars = request.len(), "cmd_run: called");
    let orchestrator = Arc::new(Orchestrator::new(config).context("Failed to start the swarm")?);

    let interrupt = Arc::clone(&orchestrator);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, draining in-flight work");
            eprintln!("{}", "Interrupted, waiting for in-flight workers...".yellow());
            interrupt.request_shutdown();
        }
    });

    println!("{} {}", "Running:".bold(), request);
    let summary = orchestrator.run(request).await;
    ctrl_c.abort();
    let _ = ctrl_c.await;

    let logger = orchestrator.take_event_logger();
    drop(orchestrator);
    if let Some(handle) = logger {
        drain_event_logger(handle, Duration::from_secs(2)).await;
    }

    print_summary(&summary);
    match summary.outcome {
        RunOutcome::Aborted => Err(eyre::eyre!(
            "Run aborted: {}",
            summary.error.unwrap_or_else(|| "unknown error".to_string())
        )),
        _ => Ok(()),
    }
}

fn print_summary(summary: &RunSummary) {
    let outcome = match summary.outcome {
        RunOutcome::Completed => summary.outcome.to_string().as_str().green(),
        RunOutcome::Interrupted => summary.outcome.to_string().as_str().yellow(),
        RunOutcome::Aborted => summary.outcome.to_string().as_str().red(),
    };
    let health = match summary.healthy {
        Some(true) => "green".green(),
        Some(false) => "red".red(),
        None => "unchecked".dimmed(),
    };
    let metrics = &summary.metrics;

    println!();
    println!("{} {}", "Run".bold(), outcome);
    println!("  elapsed:     {:.1}s", summary.elapsed_ms as f64 / 1000.0);
    println!("  iterations:  {}", summary.planner_iterations);
    println!(
        "  tasks:       {} completed, {} failed, {} pending",
        metrics.completed_tasks, metrics.failed_tasks, metrics.pending_tasks
    );
    println!(
        "  merges:      {} merged, {} conflicts, {} failed ({:.0}% success)",
        summary.merges.merged,
        summary.merges.conflicts,
        summary.merges.failed,
        metrics.merge_success_rate * 100.0
    );
    println!(
        "  tokens:      {} (${:.2})",
        metrics.total_tokens_used, metrics.total_cost_usd
    );
    println!("  main:        {} after {} sweeps", health, summary.sweeps);
    if let Some(error) = &summary.error {
        println!("  {} {}", "error:".red(), error);
    }
}

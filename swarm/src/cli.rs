//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// AgentSwarm - fleet orchestrator for ephemeral coding workers
#[derive(Parser)]
#[command(
    name = "swarm",
    about = "Plan, dispatch, merge and reconcile work across a fleet of coding workers",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Log to stderr instead of the log file
    #[arg(long = "log-stderr", global = true)]
    pub log_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one request to completion
    Run {
        /// What the swarm should build
        request: String,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load, validate and print the resolved configuration
    Check,
}

/// Default log file location
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentswarm")
        .join("logs")
        .join("swarm.log")
}

/// Map a level name to a tracing level; unknown names yield `None`
pub fn parse_level(name: &str) -> Option<tracing::Level> {
    match name.trim().to_uppercase().as_str() {
        "TRACE" => Some(tracing::Level::TRACE),
        "DEBUG" => Some(tracing::Level::DEBUG),
        "INFO" => Some(tracing::Level::INFO),
        "WARN" | "WARNING" => Some(tracing::Level::WARN),
        "ERROR" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

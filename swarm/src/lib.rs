//! AgentSwarm - orchestrator for a fleet of ephemeral coding workers
//!
//! A planner breaks a request into small tasks, workers execute them in
//! isolated sandboxes and report handoffs, finished branches merge into main
//! through a serialized merge queue, and a reconciler keeps main building.
//!
//! # Modules
//!
//! - [`queue`] - task lifecycle and the priority-ordered pending pool
//! - [`worker`] - sandbox launchers, the worker pool and bounded dispatch
//! - [`merge`] - git runner and merge queue
//! - [`planning`] - planner, subplanners and response parsing
//! - [`reconciler`] - build/test/conflict sweeps and fix tasks
//! - [`monitor`] - metrics and timeout detection
//! - [`orchestrator`] - wiring and the run lifecycle

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod llm;
pub mod merge;
pub mod monitor;
pub mod orchestrator;
pub mod planning;
pub mod prompts;
pub mod queue;
pub mod reconciler;
pub mod worker;

pub use config::Config;
pub use orchestrator::Orchestrator;

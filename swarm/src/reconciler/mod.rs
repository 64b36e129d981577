//! Reconciler
//!
//! Sweeps the main branch for conflict markers and build or test failures,
//! and turns what it finds into high-priority fix tasks.

mod checks;
mod sweep;

pub use checks::{CheckOutcome, ConflictMarker, conflicted_files, is_conflict_marker, run_check, scan_conflict_markers};
pub use sweep::{FixTaskHandler, Reconciler, SweepReport, render_failure};

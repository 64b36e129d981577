//! Run metrics and worker health

mod tracker;

pub use tracker::{
    MAX_SUSPICIOUS_FILES, MAX_SUSPICIOUS_LINES_ADDED, Monitor, TimeoutHandler, is_timed_out, suspicious_reason,
};

//! Pending pool entries

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

/// An entry in the pending pool heap
///
/// `BinaryHeap` is a max-heap, so the ordering is inverted: the entry with the
/// lowest priority number (then earliest creation, then earliest enqueue)
/// compares greatest and pops first.
#[derive(Debug, Clone)]
pub(crate) struct PendingEntry {
    pub task_id: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    /// Monotonic enqueue sequence; breaks timestamp ties and marks stale entries
    pub seq: u64,
}

impl Eq for PendingEntry {}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

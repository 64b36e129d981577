//! Merging completed work into main
//!
//! All working-tree mutations go through a [`GitRunner`] while holding the
//! shared [`GitLock`].

mod git;
mod merge_queue;

#[cfg(test)]
pub(crate) use git::testing;
pub use git::{GitCli, GitError, GitLock, GitOutput, GitRunner, new_git_lock};
pub use merge_queue::{ConflictHandler, MergeOutcome, MergeQueue, MergeResult, MergeResultHandler};

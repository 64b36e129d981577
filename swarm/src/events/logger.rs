//! Event Logger - persists events to a JSONL file

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::Context;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use super::bus::EventBus;
use super::types::{EventLogEntry, SwarmEvent};

/// Appends every event as one JSON line
pub struct EventLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl EventLogger {
    /// Open (or create) the log file, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(?path, "EventLogger::open: called");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open event log {}", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one event as a JSON line
    pub fn write_event(&mut self, event: &SwarmEvent) -> eyre::Result<()> {
        let entry = EventLogEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Consume events until the channel closes
    pub async fn run(mut self, mut rx: broadcast::Receiver<SwarmEvent>) {
        debug!(path = ?self.path, "EventLogger::run: starting event logger");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Err(e) = self.write_event(&event) {
                        error!(error = %e, "EventLogger: failed to write event");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "EventLogger: lagged behind, missed events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("EventLogger: channel closed, shutting down");
                    break;
                }
            }
        }
        let _ = self.writer.flush();
    }
}

/// Read every entry back from a log file
pub fn read_events(path: impl AsRef<Path>) -> eyre::Result<Vec<EventLogEntry>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<EventLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(line, error = %e, "read_events: failed to parse line"),
        }
    }
    Ok(entries)
}

/// Subscribe to the bus now and write events from a background task
///
/// Subscribing before spawning means no event emitted after this call is missed.
pub fn spawn_event_logger(bus: &EventBus, path: impl AsRef<Path>) -> eyre::Result<tokio::task::JoinHandle<()>> {
    let logger = EventLogger::open(path)?;
    let rx = bus.subscribe();
    Ok(tokio::spawn(logger.run(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_write_and_read_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("events.jsonl");
        let mut logger = EventLogger::open(&path).unwrap();

        logger
            .write_event(&SwarmEvent::FixTasksCreated {
                task_ids: vec!["fix-1".to_string()],
            })
            .unwrap();
        logger
            .write_event(&SwarmEvent::EmptyDiff {
                task_id: "task-1".to_string(),
            })
            .unwrap();

        let entries = read_events(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event.event_type(), "FixTasksCreated");
        assert_eq!(entries[1].event.task_id(), Some("task-1"));
    }

    #[test]
    fn test_read_missing_file() {
        let temp = tempdir().unwrap();
        assert!(read_events(temp.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawned_logger_drains_until_bus_dropped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("events.jsonl");
        let bus = Arc::new(EventBus::new(16));

        let handle = spawn_event_logger(&bus, &path).unwrap();
        bus.emit(SwarmEvent::Error {
            component: "test".to_string(),
            message: "boom".to_string(),
        });
        drop(bus);
        handle.await.unwrap();

        let entries = read_events(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event.event_type(), "Error");
    }
}

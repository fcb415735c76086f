#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Synchronous event bus abstractions for governance components.
//!
//! Publishing runs to completion on the caller's thread; there is no
//! background dispatcher.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Generic event record encoded as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique identifier.
    pub id: String,
    /// Component producing the event.
    pub source: String,
    /// Event type (e.g., `governance.mode.transition`).
    pub event_type: String,
    /// ISO timestamp.
    pub timestamp: String,
    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl EventRecord {
    /// Builds a record with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4()),
            source: source.into(),
            event_type: event_type.into(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
        }
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.to_rfc3339();
        self
    }
}

/// Event publisher interface.
pub trait EventPublisher: Send + Sync {
    /// Publishes an event to the bus.
    fn publish(&self, event: EventRecord) -> Result<()>;
}

/// Bounded in-memory bus (for local development and tests).
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    backlog: Arc<Mutex<VecDeque<EventRecord>>>,
    capacity: usize,
}

impl MemoryEventBus {
    /// Creates a new bus retaining at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Snapshot of recent events retained in memory, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Returns retained events of the given type.
    #[must_use]
    pub fn of_type(&self, event_type: &str) -> Vec<EventRecord> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl EventPublisher for MemoryEventBus {
    fn publish(&self, event: EventRecord) -> Result<()> {
        let mut backlog = self.backlog.lock();
        if backlog.len() == self.capacity {
            backlog.pop_front();
        }
        backlog.push_back(event);
        Ok(())
    }
}

/// File-backed publisher useful for durable event logs.
#[derive(Debug, Clone)]
pub struct FileEventPublisher {
    path: PathBuf,
}

impl FileEventPublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating event log dir {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    /// Location of the event log.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventPublisher for FileEventPublisher {
    fn publish(&self, event: EventRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        let mut data = serde_json::to_vec(&event)?;
        data.push(b'\n');
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_event() -> EventRecord {
        EventRecord::new(
            "tester",
            "unit.test",
            serde_json::json!({ "value": 1 }),
        )
    }

    #[test]
    fn memory_bus_retains_bounded_backlog() {
        let bus = MemoryEventBus::new(2);
        for _ in 0..3 {
            bus.publish(sample_event()).unwrap();
        }
        bus.publish(EventRecord::new("tester", "other", serde_json::Value::Null))
            .unwrap();
        assert_eq!(bus.snapshot().len(), 2);
        assert_eq!(bus.of_type("other").len(), 1);
    }

    #[test]
    fn file_publisher_writes_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events/events.log");
        let publisher = FileEventPublisher::new(&path).unwrap();
        publisher.publish(sample_event()).unwrap();
        publisher.publish(sample_event()).unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("unit.test"));
    }
}

use std::{fmt, path::PathBuf, sync::Arc};

use serde_json::{json, Value};
use shared_event_bus::{EventPublisher, EventRecord, FileEventPublisher};
use shared_logging::{AuditEntry, AuditLog, JsonLogger, LogLevel, LogRecord};
use tracing::{info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::GovernanceConfig,
    error::GovernanceResult,
};

/// Builder for [`GovernanceJournal`].
pub struct GovernanceJournalBuilder {
    module: String,
    incident_log: PathBuf,
    recovery_log: PathBuf,
    operational_log: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    clock: Option<Arc<dyn Clock>>,
}

impl GovernanceJournalBuilder {
    /// Creates the builder with the two mandatory audit trails.
    #[must_use]
    pub fn new(
        module: impl Into<String>,
        incident_log: impl Into<PathBuf>,
        recovery_log: impl Into<PathBuf>,
    ) -> Self {
        Self {
            module: module.into(),
            incident_log: incident_log.into(),
            recovery_log: recovery_log.into(),
            operational_log: None,
            event_publisher: None,
            clock: None,
        }
    }

    /// Sets the operational log path.
    #[must_use]
    pub fn operational_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.operational_log = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Stamps entries from `clock` instead of the system clock.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Opens every sink.
    pub fn build(self) -> GovernanceResult<GovernanceJournal> {
        let logger = match self.operational_log {
            Some(path) => Some(JsonLogger::new(path)?),
            None => None,
        };
        Ok(GovernanceJournal {
            inner: Arc::new(JournalInner {
                module: self.module,
                incidents: AuditLog::open(self.incident_log)?,
                recoveries: AuditLog::open(self.recovery_log)?,
                logger,
                events: self.event_publisher,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            }),
        })
    }
}

/// Logging, audit, and event sinks shared by every governance component.
///
/// Operational logs and events are best effort. Audit appends are not: a
/// failed incident or recovery append is returned to the caller.
#[derive(Clone)]
pub struct GovernanceJournal {
    inner: Arc<JournalInner>,
}

struct JournalInner {
    module: String,
    incidents: AuditLog,
    recoveries: AuditLog,
    logger: Option<JsonLogger>,
    events: Option<Arc<dyn EventPublisher>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for GovernanceJournal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GovernanceJournal")
            .field("module", &self.inner.module)
            .field("incidents", &self.inner.incidents.path())
            .field("recoveries", &self.inner.recoveries.path())
            .finish_non_exhaustive()
    }
}

impl GovernanceJournal {
    /// Returns a builder.
    #[must_use]
    pub fn builder(
        module: impl Into<String>,
        incident_log: impl Into<PathBuf>,
        recovery_log: impl Into<PathBuf>,
    ) -> GovernanceJournalBuilder {
        GovernanceJournalBuilder::new(module, incident_log, recovery_log)
    }

    /// Opens the sinks named by `config`, stamping entries from `clock`.
    pub fn from_config(config: &GovernanceConfig, clock: Arc<dyn Clock>) -> GovernanceResult<Self> {
        let paths = &config.paths;
        let mut builder = Self::builder(&config.source, &paths.incident_log, &paths.recovery_log)
            .operational_log(&paths.operational_log)
            .clock(clock);
        if let Some(event_log) = &paths.event_log {
            builder = builder.event_publisher(Arc::new(FileEventPublisher::new(event_log)?));
        }
        builder.build()
    }

    /// Writes an operational log line.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message)
                .at(self.inner.clock.wall_now())
                .with_metadata(&metadata);
            if let Err(err) = logger.log(&record) {
                warn!(error = %err, log_message = message, "operational log write failed");
            }
        }
    }

    /// Publishes a governance event.
    pub fn event(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.inner.events {
            let record = EventRecord::new(&self.inner.module, event_type, payload)
                .at(self.inner.clock.wall_now());
            if let Err(err) = events.publish(record) {
                warn!(error = %err, event_type, "event publish failed");
            }
        }
    }

    /// Appends to the incident trail and mirrors it to the operational log.
    pub fn incident(
        &self,
        component: &str,
        event: &str,
        reason: &str,
        details: Value,
    ) -> GovernanceResult<()> {
        warn!(component, event, reason, "governance incident");
        let entry = AuditEntry::new(component, event, reason)
            .at(self.inner.clock.wall_now())
            .with_details(details);
        self.inner.incidents.append(&entry)?;
        self.log(
            LogLevel::Warn,
            "governance.incident",
            json!({ "component": component, "event": event, "reason": reason }),
        );
        self.event(
            "governance.incident",
            json!({ "component": component, "event": event, "reason": reason }),
        );
        Ok(())
    }

    /// Appends to the recovery trail.
    pub fn recovery(
        &self,
        component: &str,
        event: &str,
        reason: &str,
        details: Value,
    ) -> GovernanceResult<()> {
        info!(component, event, reason, "recovery action");
        let entry = AuditEntry::new(component, event, reason)
            .at(self.inner.clock.wall_now())
            .with_details(details);
        self.inner.recoveries.append(&entry)?;
        self.log(
            LogLevel::Warn,
            "governance.recovery",
            json!({ "component": component, "event": event, "reason": reason }),
        );
        self.event(
            "governance.recovery",
            json!({ "component": component, "event": event, "reason": reason }),
        );
        Ok(())
    }

    /// Location of the incident trail.
    #[must_use]
    pub fn incident_log_path(&self) -> PathBuf {
        self.inner.incidents.path().to_path_buf()
    }

    /// Location of the recovery trail.
    #[must_use]
    pub fn recovery_log_path(&self) -> PathBuf {
        self.inner.recoveries.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn incident_reaches_trail_log_and_bus() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(8));
        let journal = GovernanceJournal::builder(
            "governance",
            dir.path().join("incidents.jsonl"),
            dir.path().join("recovery.jsonl"),
        )
        .operational_log(dir.path().join("ops.jsonl"))
        .event_publisher(bus.clone())
        .build()
        .unwrap();

        journal
            .incident("mode_mutex", "MUTEX_BLOCKED", "hunt requested during train", Value::Null)
            .unwrap();

        let trail = AuditLog::read_all(journal.incident_log_path()).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event, "MUTEX_BLOCKED");
        assert!(AuditLog::read_all(journal.recovery_log_path())
            .unwrap()
            .is_empty());
        let ops = std::fs::read_to_string(dir.path().join("ops.jsonl")).unwrap();
        assert!(ops.contains("governance.incident"));
        assert_eq!(bus.of_type("governance.incident").len(), 1);
    }

    #[test]
    fn entries_are_stamped_from_the_injected_clock() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1.0));
        let bus = Arc::new(MemoryEventBus::new(8));
        let journal = GovernanceJournal::builder(
            "governance",
            dir.path().join("incidents.jsonl"),
            dir.path().join("recovery.jsonl"),
        )
        .event_publisher(bus.clone())
        .clock(clock.clone())
        .build()
        .unwrap();

        journal
            .recovery("recovery_guard", "ORPHANED_TRAINING", "no marker", Value::Null)
            .unwrap();

        let trail = AuditLog::read_all(journal.recovery_log_path()).unwrap();
        assert_eq!(trail[0].timestamp, clock.wall_now());
        let events = bus.of_type("governance.recovery");
        assert_eq!(events[0].timestamp, clock.wall_now().to_rfc3339());
    }
}

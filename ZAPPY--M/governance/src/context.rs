use std::sync::Arc;

use crate::{
    clock::{Clock, SystemClock},
    config::{GovernanceConfig, GovernancePaths},
    error::GovernanceResult,
    journal::GovernanceJournal,
    store::{StateLock, StateLockGuard},
};

/// Everything a governance component needs, passed in explicitly.
///
/// One context owns one state directory. Components share it through an
/// `Arc` and never reach for process-global state.
#[derive(Debug)]
pub struct GovernanceContext {
    config: GovernanceConfig,
    clock: Arc<dyn Clock>,
    journal: GovernanceJournal,
    lock: StateLock,
}

impl GovernanceContext {
    /// Builds a context using the system clock and sinks from `config`.
    pub fn open(config: GovernanceConfig) -> GovernanceResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Builds a context with an injected clock.
    pub fn with_clock(config: GovernanceConfig, clock: Arc<dyn Clock>) -> GovernanceResult<Self> {
        let journal = GovernanceJournal::from_config(&config, Arc::clone(&clock))?;
        Ok(Self::from_parts(config, clock, journal))
    }

    /// Assembles a context from already-built parts.
    #[must_use]
    pub fn from_parts(
        config: GovernanceConfig,
        clock: Arc<dyn Clock>,
        journal: GovernanceJournal,
    ) -> Self {
        let lock = StateLock::new(&config.paths.state_lock);
        Self {
            config,
            clock,
            journal,
            lock,
        }
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    /// Record locations.
    #[must_use]
    pub const fn paths(&self) -> &GovernancePaths {
        &self.config.paths
    }

    /// Label stamped on records written by this context.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.config.source
    }

    /// Injected time source.
    #[must_use]
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Log, audit, and event sinks.
    #[must_use]
    pub const fn journal(&self) -> &GovernanceJournal {
        &self.journal
    }

    /// Takes the cross-process state lock for a read-modify-write sequence.
    pub fn exclusive(&self) -> GovernanceResult<StateLockGuard<'_>> {
        self.lock.acquire()
    }
}

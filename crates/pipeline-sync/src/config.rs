//! Sync engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use pipeline_proto::EntityKind;

use crate::ingestor::BackoffConfig;

/// Polling behaviour of the snapshot fetcher.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Poll interval per kind.
    pub intervals: HashMap<EntityKind, Duration>,
    /// Consecutive complete snapshots a key must be missing from before it is deleted.
    pub miss_threshold: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        let intervals = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, Self::default_interval(kind)))
            .collect();
        Self {
            intervals,
            miss_threshold: 2,
        }
    }
}

impl PollConfig {
    /// Built-in interval for a kind: fast for collector metrics, slow for rules.
    #[must_use]
    pub const fn default_interval(kind: EntityKind) -> Duration {
        match kind {
            EntityKind::CollectorAgent => Duration::from_secs(3),
            EntityKind::Source | EntityKind::Destination => Duration::from_secs(10),
            EntityKind::Action | EntityKind::DataStream => Duration::from_secs(15),
            EntityKind::InstrumentationRule => Duration::from_secs(30),
        }
    }

    /// The configured interval for `kind`.
    #[must_use]
    pub fn interval(&self, kind: EntityKind) -> Duration {
        self.intervals
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Self::default_interval(kind))
    }

    /// Override the interval for one kind.
    #[must_use]
    pub fn with_interval(mut self, kind: EntityKind, interval: Duration) -> Self {
        self.intervals.insert(kind, interval);
        self
    }

    /// Set the miss threshold for snapshot-implied deletes.
    #[must_use]
    pub const fn with_miss_threshold(mut self, threshold: u32) -> Self {
        self.miss_threshold = threshold;
        self
    }
}

/// Configuration for the whole sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Snapshot polling.
    pub poll: PollConfig,
    /// Push channel reconnection backoff.
    pub backoff: BackoffConfig,
    /// How long tombstones are kept before being purged.
    pub tombstone_retention: Duration,
    /// How often expired tombstones are swept.
    pub tombstone_sweep_interval: Duration,
    /// Quiet period used to coalesce store changes into one topology rebuild.
    pub topology_debounce: Duration,
    /// Capacity of the ingestor event channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            backoff: BackoffConfig::default(),
            tombstone_retention: Duration::from_secs(300),
            tombstone_sweep_interval: Duration::from_secs(30),
            topology_debounce: Duration::from_millis(100),
            event_capacity: 64,
        }
    }
}

impl SyncConfig {
    /// Set the polling configuration.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Set the reconnection backoff.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the tombstone retention window.
    #[must_use]
    pub const fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// Set the tombstone sweep interval.
    #[must_use]
    pub const fn with_tombstone_sweep_interval(mut self, interval: Duration) -> Self {
        self.tombstone_sweep_interval = interval;
        self
    }

    /// Set the topology debounce window.
    #[must_use]
    pub const fn with_topology_debounce(mut self, debounce: Duration) -> Self {
        self.topology_debounce = debounce;
        self
    }

    /// Set the ingestor event channel capacity.
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

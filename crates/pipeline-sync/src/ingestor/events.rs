//! Push ingestor lifecycle events.

use std::time::Duration;

use pipeline_proto::EntityKind;

/// Events emitted by the push ingestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestorEvent {
    /// The push channel connected.
    Connected,
    /// The post-connect resync finished.
    Resynced {
        /// Kinds whose poll failed during the resync.
        failed: Vec<EntityKind>,
        /// Kinds that only received a partial snapshot and are flagged stale.
        stale: Vec<EntityKind>,
    },
    /// The push channel was lost.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// A message could not be decoded or validated and was dropped.
    MessageDropped {
        /// Why the message was dropped.
        reason: String,
    },
}

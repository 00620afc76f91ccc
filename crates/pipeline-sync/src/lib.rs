//! # pipeline-sync
//!
//! Client-side synchronization engine for the telemetry pipeline dashboard.
//!
//! Entities arrive from two paths: periodic snapshot polls and a push channel
//! of deltas. The [`Reconciler`] merges both into one versioned
//! [`EntityStore`], so late or duplicated input never rolls state back. User
//! writes go through the [`MutationCoordinator`], which applies them
//! optimistically and reconciles the server's answer. The [`TopologyService`]
//! derives per-stream pipeline graphs from the store and republishes them
//! when they change.
//!
//! [`SyncEngine`] wires everything together:
//!
//! ```ignore
//! let mut engine = SyncEngine::new(SyncConfig::default(), query, WsPushChannel::new(url), transport);
//! engine.topology().subscribe("default", |graph| render(graph));
//! let handle = engine.start().expect("not yet started");
//! // ...
//! handle.shutdown().await;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod ingestor;
pub mod mutation;
pub mod reconciler;
pub mod store;
pub mod topology;

pub use config::{PollConfig, SyncConfig};
pub use engine::{EngineHandle, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use fetcher::{PollReport, SnapshotFetcher, SnapshotQuery};
pub use ingestor::{
    BackoffConfig, ConnectionState, IngestorEvent, PushChannel, PushConnection, PushIngestor,
    WsPushChannel,
};
pub use mutation::{MutationCoordinator, MutationTransport};
pub use reconciler::{Decision, Provisional, Reconciler};
pub use store::{
    EntityStore, Origin, StoreChange, StoreOutcome, StoreSnapshot, SubscriptionId, Tombstone,
    VersionedEntity,
};
pub use topology::{PipelineGraph, Topology, TopologyService};

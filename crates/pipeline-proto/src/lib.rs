//! # pipeline-proto
//!
//! Entity model and message contracts shared by the dashboard sync engine:
//! typed entity records keyed per kind, version markers, derived health, and
//! the push, snapshot and mutation envelopes exchanged with the server.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod entities;
pub mod error;
pub mod messages;
pub mod types;

pub use entities::{
    Action, ActionSpec, ClusterAttribute, CollectorAgent, CollectorRole, Container, DataStream,
    Destination, EndpointFilter, Entity, InstrumentationRule, InstrumentationStatus,
    PayloadLimits, RuleScope, RuleSpec, Source,
};
pub use error::ProtoError;
pub use messages::{
    Delta, MutationRequest, MutationResponse, Op, PushMessage, QueryFilter, Snapshot,
    SnapshotRecord,
};
pub use types::{
    Condition, ConditionStatus, EntityKey, EntityKind, Health, Language, Signal, SourceId,
    Version, WorkloadKind,
};

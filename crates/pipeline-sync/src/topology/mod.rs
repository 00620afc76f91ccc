//! Pipeline topology: per-stream graphs derived from the entity store.

mod builder;
mod graph;
mod service;

pub use builder::build;
pub use graph::{
    DEFAULT_STREAM, Edge, Layer, Node, NodeAttributes, NodeId, PipelineGraph, PodSummary, Topology,
};
pub use service::{GraphSubscriptionId, TopologyService};

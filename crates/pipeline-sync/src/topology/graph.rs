//! Pipeline graph types.

use std::collections::BTreeMap;
use std::fmt;

use pipeline_proto::{Health, InstrumentationStatus, Language, Signal, SourceId};
use serde::Serialize;

/// Stream that receives every source and destination not assigned elsewhere.
pub const DEFAULT_STREAM: &str = "default";

/// Column of the pipeline graph, in data flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Instrumented workloads.
    Sources,
    /// Per-node collector tier.
    NodeCollectors,
    /// Cluster gateway tier.
    Gateway,
    /// Export targets.
    Destinations,
}

impl Layer {
    /// Every layer, in data flow order.
    pub const ALL: [Self; 4] = [
        Self::Sources,
        Self::NodeCollectors,
        Self::Gateway,
        Self::Destinations,
    ];

    /// Stable name used in node ids.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sources => "sources",
            Self::NodeCollectors => "node_collectors",
            Self::Gateway => "gateway",
            Self::Destinations => "destinations",
        }
    }

    /// Human-readable layer title.
    #[must_use]
    pub const fn title(self) -> &'static str {
        match self {
            Self::Sources => "Sources",
            Self::NodeCollectors => "Node collectors",
            Self::Gateway => "Gateway",
            Self::Destinations => "Destinations",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic node id, stable across rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Node for a source workload.
    #[must_use]
    pub fn source(stream: &str, id: &SourceId) -> Self {
        Self(format!("source:{stream}:{id}"))
    }

    /// Node collector aggregate of a stream.
    #[must_use]
    pub fn node_collectors(stream: &str) -> Self {
        Self(format!("collector:{stream}:node"))
    }

    /// Gateway aggregate of a stream.
    #[must_use]
    pub fn gateway(stream: &str) -> Self {
        Self(format!("collector:{stream}:gateway"))
    }

    /// Node for a destination.
    #[must_use]
    pub fn destination(stream: &str, id: &str) -> Self {
        Self(format!("destination:{stream}:{id}"))
    }

    /// Placeholder for an empty, not yet loaded layer.
    ///
    /// It stands for the layer, not for any entity, so it gets its own id.
    /// When the first real source or destination lands the placeholder is
    /// dropped rather than renamed, and a layer holding several entities
    /// could not reuse one id anyway. The aggregate collector nodes have no
    /// such split and keep the same id from skeleton to loaded.
    #[must_use]
    pub fn placeholder(stream: &str, layer: Layer) -> Self {
        Self(format!("placeholder:{stream}:{layer}"))
    }

    /// The id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rollup of the collector pods behind an aggregate node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PodSummary {
    /// Pods reporting ready.
    pub ready: usize,
    /// All pods.
    pub total: usize,
    /// Summed throughput in bytes per second.
    pub throughput_bytes: u64,
    /// Summed container restarts.
    pub restarts: u64,
}

/// Layer-specific node data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeAttributes {
    /// A source workload.
    Source {
        /// Instrumentation state.
        instrumentation: InstrumentationStatus,
        /// Languages detected in the workload.
        languages: Vec<Language>,
        /// Enabled instrumentation rules whose scope selects this source.
        matched_rules: usize,
    },
    /// The node collector aggregate.
    NodeCollectors {
        /// Pod rollup.
        pods: PodSummary,
        /// Enabled instrumentation rules.
        enabled_rules: usize,
    },
    /// The gateway aggregate.
    Gateway {
        /// Pod rollup.
        pods: PodSummary,
        /// Enabled actions.
        enabled_actions: usize,
    },
    /// A destination.
    Destination {
        /// Vendor type.
        destination_type: String,
        /// Exported signals.
        signals: Vec<Signal>,
    },
    /// Stand-in for a layer that has not loaded yet.
    Placeholder,
}

/// One vertex of the pipeline graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Deterministic id.
    pub id: NodeId,
    /// Column the node belongs to.
    pub layer: Layer,
    /// Display label.
    pub label: String,
    /// Rolled-up health. `None` for skeleton nodes whose layer has not been polled yet.
    pub health: Option<Health>,
    /// Layer-specific data.
    pub attributes: NodeAttributes,
}

impl Node {
    /// Whether this node is shown without health because its layer has not loaded.
    #[must_use]
    pub const fn is_skeleton(&self) -> bool {
        self.health.is_none()
    }

    /// Whether the node reports `Unhealthy`.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.health == Some(Health::Unhealthy)
    }
}

/// A directed flow between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// `{source}->{target}`.
    pub id: String,
    /// Upstream node.
    pub source: NodeId,
    /// Downstream node.
    pub target: NodeId,
    /// Number of source workloads flowing through the edge.
    pub weight: usize,
    /// Either endpoint is unhealthy.
    pub degraded: bool,
}

impl Edge {
    /// Edge between two nodes.
    #[must_use]
    pub fn new(source: NodeId, target: NodeId, weight: usize, degraded: bool) -> Self {
        Self {
            id: format!("{source}->{target}"),
            source,
            target,
            weight,
            degraded,
        }
    }
}

/// The graph of one data stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineGraph {
    /// Stream name.
    pub stream: String,
    /// Nodes sorted by layer, then id.
    pub nodes: Vec<Node>,
    /// Edges sorted by source, then target.
    pub edges: Vec<Edge>,
}

impl PipelineGraph {
    /// A graph with no nodes.
    #[must_use]
    pub fn empty(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    #[must_use]
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    /// Look up the edge between two nodes.
    #[must_use]
    pub fn edge(&self, source: &NodeId, target: &NodeId) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.source == *source && e.target == *target)
    }

    /// Nodes of one layer.
    pub fn layer(&self, layer: Layer) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.layer == layer)
    }
}

/// Graphs of every stream, keyed by stream name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Topology {
    graphs: BTreeMap<String, PipelineGraph>,
}

impl Topology {
    /// Build from per-stream graphs.
    #[must_use]
    pub fn from_graphs(graphs: impl IntoIterator<Item = PipelineGraph>) -> Self {
        Self {
            graphs: graphs.into_iter().map(|g| (g.stream.clone(), g)).collect(),
        }
    }

    /// Graph of one stream.
    #[must_use]
    pub fn get(&self, stream: &str) -> Option<&PipelineGraph> {
        self.graphs.get(stream)
    }

    /// Stream names, sorted.
    pub fn streams(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }

    /// Every graph, sorted by stream.
    pub fn graphs(&self) -> impl Iterator<Item = &PipelineGraph> {
        self.graphs.values()
    }

    /// Number of streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Whether there are no streams.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

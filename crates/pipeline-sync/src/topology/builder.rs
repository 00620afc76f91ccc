//! Pure derivation of the pipeline graph from store contents.
//!
//! Every stream gets the same four layers: its sources feed the node
//! collector aggregate, which feeds the gateway aggregate, which feeds each of
//! the stream's destinations. Collector pods are cluster-wide, so every stream
//! shares the same pod rollup under its own aggregate ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use pipeline_proto::{
    CollectorAgent, CollectorRole, Destination, EntityKind, Health, InstrumentationRule, Source,
    SourceId,
};

use super::graph::{
    DEFAULT_STREAM, Edge, Layer, Node, NodeAttributes, NodeId, PipelineGraph, PodSummary, Topology,
};
use crate::store::StoreSnapshot;

#[derive(Default)]
struct Members<'a> {
    sources: BTreeMap<&'a SourceId, &'a Source>,
    destinations: BTreeMap<&'a str, &'a Destination>,
}

/// Build the graph of every stream. Never fails.
#[must_use]
pub fn build(snapshot: &StoreSnapshot) -> Topology {
    let streams = partition(snapshot);
    let shared = Shared::new(snapshot);
    Topology::from_graphs(
        streams
            .iter()
            .map(|(stream, members)| build_stream(stream, members, &shared)),
    )
}

/// Group sources and destinations by stream membership.
///
/// Membership is the union of the entity's own list and the lists held by
/// data stream records. Entities with no membership fall into the default
/// stream, which is always present.
fn partition(snapshot: &StoreSnapshot) -> BTreeMap<&str, Members<'_>> {
    let mut streams: BTreeMap<&str, Members<'_>> = BTreeMap::new();
    streams.entry(DEFAULT_STREAM).or_default();

    let mut source_streams: HashMap<&SourceId, BTreeSet<&str>> = HashMap::new();
    let mut destination_streams: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for data_stream in snapshot.data_streams() {
        let name = data_stream.name.as_str();
        streams.entry(name).or_default();
        for id in &data_stream.sources {
            source_streams.entry(id).or_default().insert(name);
        }
        for id in &data_stream.destinations {
            destination_streams.entry(id.as_str()).or_default().insert(name);
        }
    }

    for source in snapshot.sources() {
        let mut names = source_streams.remove(&source.id).unwrap_or_default();
        names.extend(source.data_streams.iter().map(String::as_str));
        if names.is_empty() {
            names.insert(DEFAULT_STREAM);
        }
        for name in names {
            streams.entry(name).or_default().sources.insert(&source.id, source);
        }
    }

    for destination in snapshot.destinations() {
        let mut names = destination_streams
            .remove(destination.id.as_str())
            .unwrap_or_default();
        names.extend(destination.data_streams.iter().map(String::as_str));
        if names.is_empty() {
            names.insert(DEFAULT_STREAM);
        }
        for name in names {
            streams
                .entry(name)
                .or_default()
                .destinations
                .insert(destination.id.as_str(), destination);
        }
    }

    streams
}

/// Store contents shared by every stream.
struct Shared<'a> {
    sources_loaded: bool,
    destinations_loaded: bool,
    collectors_loaded: bool,
    node_pods: PodRollup,
    gateway_pods: PodRollup,
    enabled_rules: Vec<&'a InstrumentationRule>,
    enabled_actions: usize,
}

struct PodRollup {
    summary: PodSummary,
    health: Health,
}

impl PodRollup {
    fn of<'a>(pods: impl Iterator<Item = &'a CollectorAgent>) -> Self {
        let mut summary = PodSummary::default();
        let mut health = Health::Healthy;
        for pod in pods {
            summary.total += 1;
            if pod.ready {
                summary.ready += 1;
            }
            summary.throughput_bytes = summary.throughput_bytes.saturating_add(pod.throughput_bytes);
            summary.restarts += u64::from(pod.restarts);
            health = health.max(pod.health());
        }
        Self { summary, health }
    }
}

impl<'a> Shared<'a> {
    fn new(snapshot: &'a StoreSnapshot) -> Self {
        let role = |role: CollectorRole| snapshot.collectors().filter(move |c| c.role == role);
        Self {
            sources_loaded: snapshot.has_baseline(EntityKind::Source),
            destinations_loaded: snapshot.has_baseline(EntityKind::Destination),
            collectors_loaded: snapshot.has_baseline(EntityKind::CollectorAgent),
            node_pods: PodRollup::of(role(CollectorRole::NodeCollector)),
            gateway_pods: PodRollup::of(role(CollectorRole::Gateway)),
            enabled_rules: snapshot.rules().filter(|r| !r.disabled).collect(),
            enabled_actions: snapshot.actions().filter(|a| !a.disabled).count(),
        }
    }

    fn health(&self, loaded: bool, health: Health) -> Option<Health> {
        loaded.then_some(health)
    }
}

/// Skeleton node for an empty layer. See [`NodeId::placeholder`] for why it
/// never shares an id with a real node.
fn placeholder(stream: &str, layer: Layer) -> Node {
    Node {
        id: NodeId::placeholder(stream, layer),
        layer,
        label: layer.title().to_string(),
        health: None,
        attributes: NodeAttributes::Placeholder,
    }
}

fn build_stream(stream: &str, members: &Members<'_>, shared: &Shared<'_>) -> PipelineGraph {
    let mut sources: Vec<Node> = members
        .sources
        .values()
        .map(|source| Node {
            id: NodeId::source(stream, &source.id),
            layer: Layer::Sources,
            label: source
                .reported_name
                .clone()
                .unwrap_or_else(|| source.id.name.clone()),
            health: shared.health(shared.sources_loaded, Health::from_conditions(&source.conditions)),
            attributes: NodeAttributes::Source {
                instrumentation: source.instrumentation,
                languages: source.languages().into_iter().collect(),
                matched_rules: shared
                    .enabled_rules
                    .iter()
                    .filter(|r| r.scope.matches(source))
                    .count(),
            },
        })
        .collect();
    let workloads = sources.len();
    if sources.is_empty() && !shared.sources_loaded {
        sources.push(placeholder(stream, Layer::Sources));
    }

    let node_collectors = Node {
        id: NodeId::node_collectors(stream),
        layer: Layer::NodeCollectors,
        label: Layer::NodeCollectors.title().to_string(),
        health: shared.health(shared.collectors_loaded, shared.node_pods.health),
        attributes: NodeAttributes::NodeCollectors {
            pods: shared.node_pods.summary,
            enabled_rules: shared.enabled_rules.len(),
        },
    };

    let gateway = Node {
        id: NodeId::gateway(stream),
        layer: Layer::Gateway,
        label: Layer::Gateway.title().to_string(),
        health: shared.health(shared.collectors_loaded, shared.gateway_pods.health),
        attributes: NodeAttributes::Gateway {
            pods: shared.gateway_pods.summary,
            enabled_actions: shared.enabled_actions,
        },
    };

    let mut destinations: Vec<Node> = members
        .destinations
        .values()
        .map(|destination| Node {
            id: NodeId::destination(stream, &destination.id),
            layer: Layer::Destinations,
            label: if destination.name.is_empty() {
                destination.id.clone()
            } else {
                destination.name.clone()
            },
            health: shared.health(
                shared.destinations_loaded,
                Health::from_conditions(&destination.conditions),
            ),
            attributes: NodeAttributes::Destination {
                destination_type: destination.destination_type.clone(),
                signals: destination.exported_signals.iter().copied().collect(),
            },
        })
        .collect();
    if destinations.is_empty() && !shared.destinations_loaded {
        destinations.push(placeholder(stream, Layer::Destinations));
    }

    let mut edges = EdgeSet::default();
    for source in &sources {
        let weight = usize::from(!matches!(source.attributes, NodeAttributes::Placeholder));
        edges.add(source, &node_collectors, weight);
    }
    edges.add(&node_collectors, &gateway, workloads);
    for destination in &destinations {
        edges.add(&gateway, destination, workloads);
    }

    let mut nodes = sources;
    nodes.push(node_collectors);
    nodes.push(gateway);
    nodes.append(&mut destinations);
    nodes.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.id.cmp(&b.id)));

    PipelineGraph {
        stream: stream.to_string(),
        nodes,
        edges: edges.into_sorted(),
    }
}

/// Edges deduplicated by `(source, target)`, weights summed.
#[derive(Default)]
struct EdgeSet {
    edges: BTreeMap<(NodeId, NodeId), Edge>,
}

impl EdgeSet {
    fn add(&mut self, from: &Node, to: &Node, weight: usize) {
        let degraded = from.is_unhealthy() || to.is_unhealthy();
        self.edges
            .entry((from.id.clone(), to.id.clone()))
            .and_modify(|edge| {
                edge.weight += weight;
                edge.degraded |= degraded;
            })
            .or_insert_with(|| Edge::new(from.id.clone(), to.id.clone(), weight, degraded));
    }

    fn into_sorted(self) -> Vec<Edge> {
        self.edges.into_values().collect()
    }
}

//! End-to-end scenarios across the fetcher, ingestor, reconciler, mutation
//! coordinator and topology service.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pipeline_proto::{
    CollectorAgent, CollectorRole, Condition, ConditionStatus, DataStream, Delta, Destination,
    Entity, EntityKey,
    EntityKind, Health, MutationRequest, MutationResponse, Op, PushMessage, QueryFilter, Signal,
    Snapshot, SnapshotRecord, Source, SourceId, Version, WorkloadKind,
};
use pipeline_sync::topology::{DEFAULT_STREAM, Layer, NodeAttributes, NodeId, PodSummary};
use pipeline_sync::{
    BackoffConfig, Decision, IngestorEvent, MutationTransport, Origin, PollConfig, PushChannel,
    PushConnection, PushIngestor, Reconciler, SnapshotFetcher, SnapshotQuery, SyncConfig,
    SyncEngine, SyncError, SyncResult, TopologyService,
};
use tokio::sync::{Notify, mpsc, watch};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Route engine logs to the test harness. Filter with `RUST_LOG`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered record of what the fakes saw, shared between them.
type Journal = Arc<Mutex<Vec<String>>>;

/// Serves scripted snapshots per kind, then empty complete ones.
#[derive(Default)]
struct FakeQuery {
    responses: Mutex<HashMap<EntityKind, VecDeque<Snapshot>>>,
    journal: Journal,
}

impl FakeQuery {
    fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    fn push(&self, snapshot: Snapshot) {
        self.responses
            .lock()
            .entry(snapshot.kind)
            .or_default()
            .push_back(snapshot);
    }
}

impl SnapshotQuery for FakeQuery {
    async fn list(&self, kind: EntityKind, _filter: &QueryFilter) -> SyncResult<Snapshot> {
        self.journal.lock().push(format!("list {kind}"));
        let next = self.responses.lock().get_mut(&kind).and_then(VecDeque::pop_front);
        Ok(next.unwrap_or_else(|| Snapshot::complete(kind, vec![])))
    }
}

/// Answers like a server scoped to the filter's stream: both data streams are
/// always listed, but only stream "a" has a source.
struct StreamScopedQuery;

impl SnapshotQuery for StreamScopedQuery {
    async fn list(&self, kind: EntityKind, filter: &QueryFilter) -> SyncResult<Snapshot> {
        let records = match kind {
            EntityKind::DataStream => ["a", "b"]
                .into_iter()
                .map(|name| {
                    SnapshotRecord::new(
                        Version::new(1),
                        Entity::DataStream(DataStream {
                            name: name.to_string(),
                            sources: vec![],
                            destinations: vec![],
                        }),
                    )
                })
                .collect(),
            EntityKind::Source if filter.stream.as_deref() == Some("a") => {
                let mut source = Source::new(SourceId::new("shop", WorkloadKind::Deployment, "cart"));
                source.data_streams = vec!["a".to_string()];
                vec![SnapshotRecord::new(Version::new(1), Entity::Source(source))]
            }
            _ => vec![],
        };
        Ok(Snapshot::complete(kind, records))
    }
}

/// Each connect pops the next script; an exhausted script holds the connection open.
#[derive(Default)]
struct FakeChannel {
    scripts: Mutex<VecDeque<Vec<SyncResult<String>>>>,
    journal: Journal,
}

struct FakeConnection {
    messages: VecDeque<SyncResult<String>>,
    journal: Journal,
}

impl PushConnection for FakeConnection {
    async fn next_message(&mut self) -> Option<SyncResult<String>> {
        match self.messages.pop_front() {
            Some(message) => {
                self.journal.lock().push("deliver".to_string());
                Some(message)
            }
            None => std::future::pending().await,
        }
    }
}

impl PushChannel for FakeChannel {
    type Connection = FakeConnection;

    async fn connect(&self) -> SyncResult<FakeConnection> {
        let script = self.scripts.lock().pop_front();
        let script = script.ok_or_else(|| SyncError::Channel("refused".to_string()))?;
        self.journal.lock().push("connect".to_string());
        Ok(FakeConnection {
            messages: script.into(),
            journal: Arc::clone(&self.journal),
        })
    }
}

/// Accepts every mutation, optionally waiting on a gate first.
#[derive(Default)]
struct GatedTransport {
    gate: Option<Arc<Notify>>,
}

impl MutationTransport for GatedTransport {
    async fn submit(&self, _request: MutationRequest) -> SyncResult<MutationResponse> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(MutationResponse::accepted(None))
    }
}

fn jaeger(version_tag: &str, healthy: bool) -> Destination {
    let status = if healthy {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    Destination {
        id: "jaeger".to_string(),
        name: format!("Jaeger {version_tag}"),
        destination_type: "jaeger".to_string(),
        exported_signals: BTreeSet::from([Signal::Traces]),
        fields: Default::default(),
        conditions: vec![Condition::new("DestinationReachable", status)],
        data_streams: vec![],
    }
}

fn push_message(op: Op, version: u64, destination: Option<&Destination>) -> String {
    PushMessage {
        kind: EntityKind::Destination,
        key: "jaeger".to_string(),
        op,
        version: Version::new(version),
        payload: destination.map(|d| serde_json::to_value(d).unwrap()),
    }
    .to_json()
    .unwrap()
}

fn jaeger_key() -> EntityKey {
    EntityKey::name("jaeger")
}

fn fetcher(query: FakeQuery, reconciler: &Arc<Reconciler>) -> Arc<SnapshotFetcher<FakeQuery>> {
    Arc::new(SnapshotFetcher::new(
        query,
        Arc::clone(reconciler),
        PollConfig::default(),
    ))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_poll_never_rolls_back_a_newer_push() {
    init_logging();
    let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
    let query = FakeQuery::default();
    query.push(Snapshot::complete(
        EntityKind::Destination,
        vec![SnapshotRecord::new(Version::new(5), Entity::Destination(jaeger("v5", true)))],
    ));
    query.push(Snapshot::complete(
        EntityKind::Destination,
        vec![SnapshotRecord::new(Version::new(6), Entity::Destination(jaeger("v6", true)))],
    ));
    let fetcher = fetcher(query, &reconciler);

    assert_eq!(fetcher.poll(EntityKind::Destination).await, Ok(1));

    let pushed = PushMessage::from_json(&push_message(Op::Update, 7, Some(&jaeger("v7", false))))
        .unwrap();
    assert_eq!(reconciler.apply_message(pushed), Ok(Decision::Applied));

    // The v6 snapshot was taken before the push landed.
    assert_eq!(fetcher.poll(EntityKind::Destination).await, Ok(0));

    let held = reconciler.get(EntityKind::Destination, &jaeger_key()).unwrap();
    assert_eq!(held.version, Version::new(7));
    assert_eq!(held.origin, Origin::Push);
    assert_eq!(held.entity.health(), Health::Unhealthy);
}

#[tokio::test(start_paused = true)]
async fn reconnect_resyncs_every_kind_before_reading_deltas() {
    init_logging();
    let journal: Journal = Arc::default();
    let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
    let fetcher = fetcher(FakeQuery::with_journal(Arc::clone(&journal)), &reconciler);
    let channel = FakeChannel {
        journal: Arc::clone(&journal),
        ..FakeChannel::default()
    };
    channel.scripts.lock().extend([
        vec![
            Ok(push_message(Op::Create, 1, Some(&jaeger("v1", true)))),
            Err(SyncError::Channel("reset".to_string())),
        ],
        vec![Ok(push_message(Op::Update, 2, Some(&jaeger("v2", false))))],
    ]);
    let (event_tx, mut events) = mpsc::channel(32);
    let ingestor = PushIngestor::new(
        channel,
        fetcher,
        Arc::clone(&reconciler),
        BackoffConfig::default().with_jitter(false),
        event_tx,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let running = tokio::spawn(ingestor.run(shutdown_rx));

    let mut resyncs = 0;
    while resyncs < 2 {
        if let Some(IngestorEvent::Resynced { failed, stale }) = events.recv().await {
            assert!(failed.is_empty());
            assert!(stale.is_empty());
            resyncs += 1;
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown_tx.send(true).unwrap();
    running.await.unwrap();

    // Between each connect and the first delta after it, every kind was listed.
    let journal = journal.lock().clone();
    let connects: Vec<usize> = journal
        .iter()
        .enumerate()
        .filter(|(_, entry)| *entry == "connect")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(connects.len(), 2);
    for start in connects {
        let listed: HashSet<&str> = journal[start + 1..]
            .iter()
            .take_while(|entry| *entry != "deliver")
            .filter_map(|entry| entry.strip_prefix("list "))
            .collect();
        let expected: HashSet<&str> = EntityKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(listed, expected);
    }

    let held = reconciler.get(EntityKind::Destination, &jaeger_key()).unwrap();
    assert_eq!(held.version, Version::new(2));
    assert_eq!(held.entity.health(), Health::Unhealthy);
}

#[tokio::test]
async fn back_to_back_mutations_on_one_destination_conflict() {
    init_logging();
    let gate = Arc::new(Notify::new());
    let engine = Arc::new(SyncEngine::new(
        SyncConfig::default(),
        FakeQuery::default(),
        FakeChannel::default(),
        GatedTransport {
            gate: Some(Arc::clone(&gate)),
        },
    ));
    engine
        .reconciler()
        .apply(
            Delta::upsert(
                Op::Create,
                Version::new(3),
                Entity::Destination(jaeger("v3", true)),
            ),
            Origin::Poll,
        )
        .unwrap();

    let first = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .mutations()
                .update(Entity::Destination(jaeger("edited", true)))
                .await
        })
    };
    while !engine
        .mutations()
        .is_in_flight(EntityKind::Destination, &jaeger_key())
    {
        tokio::task::yield_now().await;
    }

    // The optimistic write is visible while the first mutation is pending.
    let held = engine.reconciler().get(EntityKind::Destination, &jaeger_key()).unwrap();
    assert_eq!(held.version, Version::new(4));
    assert_eq!(held.origin, Origin::Local);

    let second = engine
        .mutations()
        .delete(EntityKind::Destination, jaeger_key())
        .await;
    assert_eq!(
        second,
        Err(SyncError::Conflict {
            kind: EntityKind::Destination,
            key: jaeger_key(),
        })
    );

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok(None));
    assert!(
        !engine
            .mutations()
            .is_in_flight(EntityKind::Destination, &jaeger_key())
    );
}

#[tokio::test]
async fn tombstone_blocks_stale_resurrection() {
    init_logging();
    let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
    let query = FakeQuery::default();
    // Snapshot computed before the delete reached the client.
    query.push(Snapshot::complete(
        EntityKind::Destination,
        vec![SnapshotRecord::new(Version::new(4), Entity::Destination(jaeger("v4", true)))],
    ));
    let fetcher = fetcher(query, &reconciler);

    for message in [
        push_message(Op::Create, 3, Some(&jaeger("v3", true))),
        push_message(Op::Delete, 5, None),
    ] {
        reconciler
            .apply_message(PushMessage::from_json(&message).unwrap())
            .unwrap();
    }
    assert!(reconciler.get(EntityKind::Destination, &jaeger_key()).is_none());

    assert_eq!(fetcher.poll(EntityKind::Destination).await, Ok(0));
    assert!(reconciler.get(EntityKind::Destination, &jaeger_key()).is_none());

    // A genuine re-create at a newer version goes through.
    let recreated = PushMessage::from_json(&push_message(Op::Create, 6, Some(&jaeger("v6", true))))
        .unwrap();
    assert_eq!(reconciler.apply_message(recreated), Ok(Decision::Applied));
}

#[tokio::test]
async fn topology_rolls_up_collector_health() {
    init_logging();
    let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
    let query = FakeQuery::default();
    let checkout = SourceId::new("shop", WorkloadKind::Deployment, "checkout");
    let mut source = Source::new(checkout.clone());
    source.data_streams = vec!["payments".to_string()];
    query.push(Snapshot::complete(
        EntityKind::Source,
        vec![SnapshotRecord::new(Version::new(1), Entity::Source(source))],
    ));
    query.push(Snapshot::complete(
        EntityKind::Destination,
        vec![SnapshotRecord::new(Version::new(1), Entity::Destination(jaeger("v1", true)))],
    ));
    query.push(Snapshot::complete(
        EntityKind::CollectorAgent,
        ["gw-1", "gw-2"]
            .into_iter()
            .enumerate()
            .map(|(i, pod)| {
                SnapshotRecord::new(
                    Version::new(1),
                    Entity::CollectorAgent(CollectorAgent {
                        pod_name: pod.to_string(),
                        role: CollectorRole::Gateway,
                        node_name: None,
                        ready: i == 0,
                        restarts: 2,
                        throughput_bytes: 1_000,
                        last_scrape: None,
                        conditions: vec![],
                    }),
                )
            })
            .collect(),
    ));
    let fetcher = fetcher(query, &reconciler);
    let service = TopologyService::new(Arc::clone(&reconciler), Duration::from_millis(100));

    let report = fetcher.poll_all().await;
    assert!(report.is_complete());
    let changed = service.rebuild_now();
    assert!(changed.contains(&"payments".to_string()));

    let topology = service.topology();
    assert!(topology.get(DEFAULT_STREAM).is_some());
    let payments = topology.get("payments").unwrap();

    let gateway = payments.node(&NodeId::gateway("payments")).unwrap();
    assert_eq!(gateway.health, Some(Health::Unhealthy));
    assert_eq!(
        gateway.attributes,
        NodeAttributes::Gateway {
            pods: PodSummary {
                ready: 1,
                total: 2,
                throughput_bytes: 2_000,
                restarts: 4,
            },
            enabled_actions: 0,
        }
    );

    let source_node = NodeId::source("payments", &checkout);
    let node_collectors = NodeId::node_collectors("payments");
    let source_edge = payments.edge(&source_node, &node_collectors).unwrap();
    assert_eq!(source_edge.weight, 1);
    assert!(!source_edge.degraded);
    assert!(
        payments
            .edge(&node_collectors, &NodeId::gateway("payments"))
            .unwrap()
            .degraded
    );

    // The unassigned destination lives in the default stream only.
    assert!(payments.node(&NodeId::destination("payments", "jaeger")).is_none());
    let default = topology.get(DEFAULT_STREAM).unwrap();
    assert!(default.node(&NodeId::destination(DEFAULT_STREAM, "jaeger")).is_some());

    // Every edge joins two nodes of its own graph and ids are unique.
    for graph in topology.graphs() {
        let ids: HashSet<&NodeId> = graph.nodes.iter().map(|n| &n.id).collect();
        assert_eq!(ids.len(), graph.nodes.len());
        for edge in &graph.edges {
            assert!(ids.contains(&edge.source) && ids.contains(&edge.target));
        }
    }
}

#[tokio::test]
async fn switching_streams_shows_skeleton_until_the_new_stream_loads() {
    init_logging();
    let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
    let fetcher = SnapshotFetcher::new(StreamScopedQuery, Arc::clone(&reconciler), PollConfig::default());
    let service = TopologyService::new(Arc::clone(&reconciler), Duration::from_millis(100));

    fetcher.set_filter(QueryFilter::stream("a"));
    assert!(fetcher.poll_all().await.is_complete());
    service.rebuild_now();
    let a = service.topology().get("a").cloned().unwrap();
    assert_eq!(a.layer(Layer::Sources).count(), 1);
    assert!(a.node(&NodeId::placeholder("a", Layer::Sources)).is_none());

    assert!(fetcher.set_filter(QueryFilter::stream("b")));
    service.rebuild_now();
    let b = service.topology().get("b").cloned().unwrap();
    let sources: Vec<_> = b.layer(Layer::Sources).map(|n| n.id.clone()).collect();
    assert_eq!(sources, vec![NodeId::placeholder("b", Layer::Sources)]);
    assert_eq!(b.node(&NodeId::gateway("b")).unwrap().health, None);

    assert!(fetcher.poll_all().await.is_complete());
    service.rebuild_now();
    let b = service.topology().get("b").cloned().unwrap();
    assert_eq!(b.layer(Layer::Sources).count(), 0);
    assert_eq!(b.node(&NodeId::gateway("b")).unwrap().health, Some(Health::Healthy));
}

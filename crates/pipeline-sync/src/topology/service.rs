//! Debounced topology rebuilds and per-stream graph subscriptions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pipeline_proto::EntityKind;
use tokio::sync::{Notify, watch};
use tokio::time::sleep;
use tracing::debug;

use super::builder::build;
use super::graph::{PipelineGraph, Topology};
use crate::reconciler::Reconciler;
use crate::store::SubscriptionId;

type GraphCallback = Arc<dyn Fn(&PipelineGraph) + Send + Sync>;

/// Handle returned by [`TopologyService::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphSubscriptionId(u64);

struct GraphSubscriber {
    id: GraphSubscriptionId,
    stream: String,
    callback: GraphCallback,
}

#[derive(Default)]
struct Dirty {
    flag: AtomicBool,
    notify: Notify,
}

impl Dirty {
    fn mark(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::SeqCst)
    }
}

/// Keeps the topology current as the store changes.
pub struct TopologyService {
    reconciler: Arc<Reconciler>,
    debounce: Duration,
    dirty: Arc<Dirty>,
    current: Mutex<Topology>,
    subscribers: Mutex<Vec<GraphSubscriber>>,
    next_id: Mutex<u64>,
    store_subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl TopologyService {
    /// Create a service over `reconciler`, coalescing changes within `debounce`.
    ///
    /// The initial topology is built immediately.
    #[must_use]
    pub fn new(reconciler: Arc<Reconciler>, debounce: Duration) -> Self {
        let initial = build(&reconciler.snapshot());
        Self {
            reconciler,
            debounce,
            dirty: Arc::new(Dirty::default()),
            current: Mutex::new(initial),
            subscribers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            store_subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Watch every kind in the store. Idempotent.
    pub fn attach(&self) {
        let mut subscriptions = self.store_subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        for kind in EntityKind::ALL {
            let dirty = Arc::clone(&self.dirty);
            subscriptions.push(self.reconciler.subscribe(kind, move |_| dirty.mark()));
        }
    }

    /// Stop watching the store.
    pub fn detach(&self) {
        for id in self.store_subscriptions.lock().drain(..) {
            self.reconciler.unsubscribe(id);
        }
    }

    /// Call `callback` with the stream's graph every time it changes.
    pub fn subscribe(
        &self,
        stream: impl Into<String>,
        callback: impl Fn(&PipelineGraph) + Send + Sync + 'static,
    ) -> GraphSubscriptionId {
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            GraphSubscriptionId(*next)
        };
        self.subscribers.lock().push(GraphSubscriber {
            id,
            stream: stream.into(),
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a graph subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: GraphSubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// The latest graph of one stream.
    #[must_use]
    pub fn current(&self, stream: &str) -> Option<PipelineGraph> {
        self.current.lock().get(stream).cloned()
    }

    /// The latest topology.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.current.lock().clone()
    }

    /// Rebuild synchronously and notify subscribers of changed streams.
    ///
    /// Returns the names of the streams whose graph changed. A stream that
    /// disappeared is published as an empty graph.
    pub fn rebuild_now(&self) -> Vec<String> {
        let next = build(&self.reconciler.snapshot());

        let changed: Vec<PipelineGraph> = {
            let mut current = self.current.lock();
            let mut changed: Vec<PipelineGraph> = next
                .graphs()
                .filter(|graph| current.get(&graph.stream) != Some(*graph))
                .cloned()
                .collect();
            changed.extend(
                current
                    .streams()
                    .filter(|stream| next.get(stream).is_none())
                    .map(PipelineGraph::empty),
            );
            *current = next;
            changed
        };

        if changed.is_empty() {
            return Vec::new();
        }
        debug!(streams = changed.len(), "topology changed");

        let subscribers: Vec<(String, GraphCallback)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.stream.clone(), Arc::clone(&s.callback)))
            .collect();
        for graph in &changed {
            for (_, callback) in subscribers.iter().filter(|(stream, _)| *stream == graph.stream) {
                callback(graph);
            }
        }

        changed.into_iter().map(|graph| graph.stream).collect()
    }

    /// Rebuild after each burst of store changes until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.attach();

        loop {
            tokio::select! {
                () = self.dirty.notify.notified() => {}
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                () = sleep(self.debounce) => {}
                _ = shutdown.changed() => break,
            }

            if self.dirty.take() {
                self.rebuild_now();
            }
        }

        self.detach();
        debug!("topology service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Origin;
    use crate::topology::graph::{DEFAULT_STREAM, Layer, NodeId};
    use pipeline_proto::{
        Condition, ConditionStatus, Delta, Entity, EntityKey, Op, Source, SourceId, Version,
        WorkloadKind,
    };

    fn source(name: &str, healthy: bool, streams: &[&str]) -> Entity {
        let mut s = Source::new(SourceId::new("nsA", WorkloadKind::Deployment, name));
        let status = if healthy {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        s.conditions.push(Condition::new("AgentEnabled", status));
        s.data_streams = streams.iter().map(ToString::to_string).collect();
        Entity::Source(s)
    }

    fn push(reconciler: &Reconciler, version: u64, entity: Entity) {
        reconciler
            .apply(Delta::upsert(Op::Update, Version::new(version), entity), Origin::Push)
            .unwrap();
    }

    fn recorder(service: &TopologyService, stream: &str) -> Arc<Mutex<Vec<PipelineGraph>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service.subscribe(stream, move |graph| sink.lock().push(graph.clone()));
        seen
    }

    #[test]
    fn test_initial_topology_has_default_stream() {
        let service = TopologyService::new(
            Arc::new(Reconciler::new(Duration::from_secs(300))),
            Duration::from_millis(100),
        );

        assert!(service.current(DEFAULT_STREAM).is_some());
        assert_eq!(service.topology().len(), 1);
    }

    #[test]
    fn test_rebuild_notifies_only_changed_streams() {
        let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
        let service = TopologyService::new(Arc::clone(&reconciler), Duration::from_millis(100));
        let default_seen = recorder(&service, DEFAULT_STREAM);
        let checkout_seen = recorder(&service, "checkout");

        push(&reconciler, 1, source("cart", true, &["checkout"]));
        let changed = service.rebuild_now();

        assert_eq!(changed, ["checkout"]);
        assert!(default_seen.lock().is_empty());
        assert_eq!(checkout_seen.lock().len(), 1);

        // Nothing changed, nothing published.
        assert!(service.rebuild_now().is_empty());
        assert_eq!(checkout_seen.lock().len(), 1);
    }

    #[test]
    fn test_emptied_stream_published_as_empty_graph() {
        let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
        let service = TopologyService::new(Arc::clone(&reconciler), Duration::from_millis(100));
        push(&reconciler, 1, source("cart", true, &["checkout"]));
        service.rebuild_now();
        let seen = recorder(&service, "checkout");

        reconciler
            .apply(
                Delta::delete(
                    EntityKind::Source,
                    EntityKey::Source(SourceId::new("nsA", WorkloadKind::Deployment, "cart")),
                    Version::new(2),
                ),
                Origin::Push,
            )
            .unwrap();
        service.rebuild_now();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_empty());
        assert!(service.current("checkout").is_none());
    }

    #[test]
    fn test_unsubscribe() {
        let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
        let service = TopologyService::new(Arc::clone(&reconciler), Duration::from_millis(100));
        let id = service.subscribe(DEFAULT_STREAM, |_| panic!("unsubscribed callback called"));

        assert!(service.unsubscribe(id));
        push(&reconciler, 1, source("cart", true, &[]));
        service.rebuild_now();
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_coalesced_into_one_rebuild() {
        let reconciler = Arc::new(Reconciler::new(Duration::from_secs(300)));
        reconciler.mark_baseline(EntityKind::Source);
        let service = Arc::new(TopologyService::new(
            Arc::clone(&reconciler),
            Duration::from_millis(100),
        ));
        let seen = recorder(&service, DEFAULT_STREAM);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&service).run(shutdown_rx));
        tokio::task::yield_now().await;

        for (i, name) in ["a", "b", "c", "d"].into_iter().enumerate() {
            push(&reconciler, i as u64 + 1, source(name, true, &[]));
            sleep(Duration::from_millis(10)).await;
        }
        sleep(Duration::from_millis(200)).await;

        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].layer(Layer::Sources).count(), 4);
        }

        // Health change on one source shows up after the next window.
        push(&reconciler, 10, source("a", false, &[]));
        sleep(Duration::from_millis(150)).await;
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            let a = NodeId::source(
                DEFAULT_STREAM,
                &SourceId::new("nsA", WorkloadKind::Deployment, "a"),
            );
            assert!(seen[1].node(&a).is_some_and(|n| n.is_unhealthy()));
        }

        shutdown_tx.send(true).unwrap();
        running.await.unwrap();
    }
}

//! Composition root wiring every component together.

use std::sync::Arc;
use std::time::Duration;

use pipeline_proto::{EntityKind, QueryFilter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::fetcher::{SnapshotFetcher, SnapshotQuery};
use crate::ingestor::{
    AtomicConnectionState, ConnectionState, IngestorEvent, PushChannel, PushIngestor,
};
use crate::mutation::{MutationCoordinator, MutationTransport};
use crate::reconciler::Reconciler;
use crate::store::StoreSnapshot;
use crate::topology::TopologyService;

/// Owns the store and every component that reads or writes it.
///
/// Nothing runs until [`SyncEngine::start`] is called. Reads, mutations and
/// synchronous topology rebuilds work before that.
pub struct SyncEngine<Q, C, M> {
    config: SyncConfig,
    reconciler: Arc<Reconciler>,
    fetcher: Arc<SnapshotFetcher<Q>>,
    topology: Arc<TopologyService>,
    mutations: Arc<MutationCoordinator<M>>,
    channel: Option<C>,
}

impl<Q, C, M> SyncEngine<Q, C, M>
where
    Q: SnapshotQuery,
    C: PushChannel,
    M: MutationTransport,
{
    /// Build every component from `config`.
    #[must_use]
    pub fn new(config: SyncConfig, query: Q, channel: C, transport: M) -> Self {
        let reconciler = Arc::new(Reconciler::new(config.tombstone_retention));
        let fetcher = Arc::new(SnapshotFetcher::new(
            query,
            Arc::clone(&reconciler),
            config.poll.clone(),
        ));
        let topology = Arc::new(TopologyService::new(
            Arc::clone(&reconciler),
            config.topology_debounce,
        ));
        let mutations = Arc::new(MutationCoordinator::new(transport, Arc::clone(&reconciler)));

        Self {
            config,
            reconciler,
            fetcher,
            topology,
            mutations,
            channel: Some(channel),
        }
    }

    /// Spawn the poll loops, the push ingestor, the topology service and the
    /// tombstone sweeper.
    ///
    /// Returns `None` if the engine was already started.
    pub fn start(&mut self) -> Option<EngineHandle> {
        let channel = self.channel.take()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, events) = mpsc::channel(self.config.event_capacity);

        let ingestor = PushIngestor::new(
            channel,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.reconciler),
            self.config.backoff.clone(),
            event_tx,
        );
        let state = ingestor.state_handle();

        let tasks = vec![
            tokio::spawn(Arc::clone(&self.topology).run(shutdown_rx.clone())),
            tokio::spawn(ingestor.run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&self.fetcher).run(shutdown_rx.clone())),
            tokio::spawn(sweep_tombstones(
                Arc::clone(&self.reconciler),
                self.config.tombstone_sweep_interval,
                shutdown_rx,
            )),
        ];

        info!("sync engine started");
        Some(EngineHandle {
            events,
            state,
            shutdown_tx,
            tasks,
        })
    }

    /// Show one data stream. Returns whether the filter changed.
    pub fn select_stream(&self, stream: impl Into<String>) -> bool {
        self.fetcher.set_filter(QueryFilter::stream(stream))
    }

    /// Switch the snapshot filter. Returns whether it changed.
    pub fn set_filter(&self, filter: QueryFilter) -> bool {
        self.fetcher.set_filter(filter)
    }

    /// The active snapshot filter.
    #[must_use]
    pub fn filter(&self) -> QueryFilter {
        self.fetcher.filter()
    }

    /// The reconciler, for reads and store subscriptions.
    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// The snapshot fetcher, for on-demand polls.
    #[must_use]
    pub fn fetcher(&self) -> &Arc<SnapshotFetcher<Q>> {
        &self.fetcher
    }

    /// The topology service.
    #[must_use]
    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    /// The mutation coordinator.
    #[must_use]
    pub fn mutations(&self) -> &Arc<MutationCoordinator<M>> {
        &self.mutations
    }

    /// Owned copy of the store.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.reconciler.snapshot()
    }

    /// Whether every kind has completed a baseline poll.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        EntityKind::ALL
            .into_iter()
            .all(|kind| self.reconciler.has_baseline(kind))
    }
}

/// Running engine tasks.
pub struct EngineHandle {
    events: mpsc::Receiver<IngestorEvent>,
    state: Arc<AtomicConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Wait for the next push channel lifecycle event.
    pub async fn next_event(&mut self) -> Option<IngestorEvent> {
        self.events.recv().await
    }

    /// The receiver of push channel lifecycle events.
    pub fn events(&mut self) -> &mut mpsc::Receiver<IngestorEvent> {
        &mut self.events
    }

    /// Current push connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Stop every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task failed");
            }
        }
        info!("sync engine stopped");
    }
}

async fn sweep_tombstones(
    reconciler: Arc<Reconciler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let purged = reconciler.purge_expired_tombstones();
                if purged > 0 {
                    debug!(purged, "swept tombstones");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

//! Periodic snapshot polling.
//!
//! Each kind is polled on its own interval. Snapshot records go through the
//! [`Reconciler`] with [`Origin::Poll`], so a late snapshot can never undo a
//! newer push. Complete snapshots also detect deletions the push channel
//! missed: a key absent from consecutive snapshots is deleted at the version
//! last seen for it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use pipeline_proto::{Delta, EntityKey, EntityKind, Op, QueryFilter, Snapshot, Version};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::PollConfig;
use crate::error::{SyncError, SyncResult};
use crate::reconciler::Reconciler;
use crate::store::Origin;

/// Pull-style access to the server's entity lists.
pub trait SnapshotQuery: Send + Sync + 'static {
    /// List every record of `kind` selected by `filter`.
    fn list(
        &self,
        kind: EntityKind,
        filter: &QueryFilter,
    ) -> impl Future<Output = SyncResult<Snapshot>> + Send;
}

#[derive(Debug, Clone, Copy)]
struct Miss {
    count: u32,
    version: Version,
}

/// Outcome of polling every kind.
#[derive(Debug, Default)]
pub struct PollReport {
    /// Per-kind result: records applied, or why the poll failed.
    pub results: Vec<(EntityKind, SyncResult<usize>)>,
}

impl PollReport {
    /// Kinds whose poll failed. Partial snapshots are not failures; see
    /// [`PollReport::stale_kinds`].
    #[must_use]
    pub fn failed_kinds(&self) -> Vec<EntityKind> {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Err(e) if !matches!(e, SyncError::Partial { .. })))
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Kinds that received a partial snapshot. Their records were applied
    /// and the kind is flagged stale.
    #[must_use]
    pub fn stale_kinds(&self) -> Vec<EntityKind> {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Err(SyncError::Partial { .. })))
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Whether every kind was polled successfully with a complete snapshot.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    /// Total number of records that changed the store.
    #[must_use]
    pub fn applied(&self) -> usize {
        self.results
            .iter()
            .filter_map(|(_, result)| result.as_ref().ok())
            .sum()
    }
}

/// Polls snapshots and feeds them to the reconciler.
pub struct SnapshotFetcher<Q> {
    query: Q,
    reconciler: Arc<Reconciler>,
    config: PollConfig,
    filter: watch::Sender<QueryFilter>,
    misses: Mutex<HashMap<EntityKind, HashMap<EntityKey, Miss>>>,
}

impl<Q: SnapshotQuery> SnapshotFetcher<Q> {
    /// Create a fetcher viewing everything.
    #[must_use]
    pub fn new(query: Q, reconciler: Arc<Reconciler>, config: PollConfig) -> Self {
        let (filter, _) = watch::channel(QueryFilter::all());
        Self {
            query,
            reconciler,
            config,
            filter,
            misses: Mutex::new(HashMap::new()),
        }
    }

    /// The snapshot query.
    #[must_use]
    pub const fn query(&self) -> &Q {
        &self.query
    }

    /// The active filter.
    #[must_use]
    pub fn filter(&self) -> QueryFilter {
        self.filter.borrow().clone()
    }

    /// Switch the viewed namespace or stream.
    ///
    /// Polls running under the old filter are cancelled, absence tracking
    /// starts over and every baseline is dropped, so the new view shows
    /// skeleton nodes until its own first poll lands. Running poll loops
    /// repoll at once. Returns whether the filter changed.
    pub fn set_filter(&self, filter: QueryFilter) -> bool {
        let changed = self.filter.send_if_modified(|current| {
            if *current == filter {
                false
            } else {
                *current = filter.clone();
                true
            }
        });
        if changed {
            self.misses.lock().clear();
            let reset = self.reconciler.reset_baselines();
            info!(
                namespace = ?filter.namespace,
                stream = ?filter.stream,
                reset = reset.len(),
                "poll filter changed"
            );
        }
        changed
    }

    /// Poll one kind. Returns how many records changed the store.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Transport`] if the query failed.
    /// - [`SyncError::Partial`] if the server flagged the snapshot as
    ///   incomplete. Its records are still applied.
    /// - [`SyncError::Cancelled`] if the filter changed mid-poll.
    pub async fn poll(&self, kind: EntityKind) -> SyncResult<usize> {
        let mut filter_rx = self.filter.subscribe();
        let filter = filter_rx.borrow_and_update().clone();

        let snapshot = tokio::select! {
            biased;
            _ = filter_rx.changed() => return Err(SyncError::Cancelled(kind)),
            result = self.query.list(kind, &filter) => result?,
        };

        if snapshot.kind != kind {
            return Err(SyncError::Validation(format!(
                "asked for a {kind} snapshot but received {}",
                snapshot.kind
            )));
        }
        self.ingest(kind, &filter, snapshot)
    }

    fn ingest(&self, kind: EntityKind, filter: &QueryFilter, snapshot: Snapshot) -> SyncResult<usize> {
        if *self.filter.borrow() != *filter {
            return Err(SyncError::Cancelled(kind));
        }
        let received = snapshot.records.len();
        let mut seen = HashSet::with_capacity(received);
        let mut applied = 0;

        for record in snapshot.records {
            if record.entity.kind() != kind {
                warn!(kind = %kind, other = %record.entity.kind(), "skipping foreign snapshot record");
                continue;
            }
            seen.insert(record.entity.key());
            match self
                .reconciler
                .apply(Delta::upsert(Op::Update, record.version, record.entity), Origin::Poll)
            {
                Ok(decision) if decision.is_applied() => applied += 1,
                Ok(_) => {}
                Err(e) => warn!(kind = %kind, error = %e, "skipping invalid snapshot record"),
            }
        }

        self.reconciler.mark_baseline(kind);

        if !snapshot.complete {
            self.reconciler.set_stale(kind, true);
            return Err(SyncError::Partial { kind, received });
        }

        applied += self.delete_absent(kind, filter, &seen);
        self.reconciler.set_stale(kind, false);
        debug!(kind = %kind, received, applied, "snapshot ingested");
        Ok(applied)
    }

    /// Count misses for held keys absent from a complete snapshot and delete
    /// the ones that reached the threshold.
    fn delete_absent(&self, kind: EntityKind, filter: &QueryFilter, seen: &HashSet<EntityKey>) -> usize {
        let held = self.reconciler.keys_matching(kind, filter);
        let threshold = self.config.miss_threshold.max(1);

        let mut implied = Vec::new();
        {
            let mut misses = self.misses.lock();
            let table = misses.entry(kind).or_default();
            let absent: HashMap<_, _> = held.into_iter().filter(|(key, _)| !seen.contains(key)).collect();
            table.retain(|key, _| absent.contains_key(key));

            for (key, version) in absent {
                let miss = table.entry(key.clone()).or_insert(Miss { count: 0, version });
                if miss.version != version {
                    *miss = Miss { count: 0, version };
                }
                miss.count += 1;
                if miss.count >= threshold {
                    table.remove(&key);
                    implied.push((key, version));
                }
            }
        }

        let mut deleted = 0;
        for (key, version) in implied {
            debug!(kind = %kind, key = %key, version = %version, "absent from snapshots, deleting");
            match self
                .reconciler
                .apply(Delta::delete(kind, key, version), Origin::Poll)
            {
                Ok(decision) if decision.is_applied() => deleted += 1,
                Ok(_) => {}
                Err(e) => warn!(kind = %kind, error = %e, "implied delete failed"),
            }
        }
        deleted
    }

    /// Poll every kind concurrently.
    pub async fn poll_all(&self) -> PollReport {
        let results = join_all(EntityKind::ALL.into_iter().map(|kind| async move {
            let result = self.poll(kind).await;
            if let Err(e) = &result {
                warn!(kind = %kind, error = %e, "poll failed");
            }
            (kind, result)
        }))
        .await;
        PollReport { results }
    }

    /// Poll every kind on its interval until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let loops: Vec<_> = EntityKind::ALL
            .into_iter()
            .map(|kind| {
                let fetcher = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { fetcher.poll_loop(kind, shutdown).await })
            })
            .collect();

        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "poll loop panicked");
            }
        }
    }

    async fn poll_loop(&self, kind: EntityKind, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval(kind));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut filter_rx = self.filter.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll(kind).await {
                        Ok(_) | Err(SyncError::Cancelled(_)) => {}
                        Err(e) => warn!(kind = %kind, error = %e, "poll failed"),
                    }
                }
                Ok(()) = filter_rx.changed() => {
                    debug!(kind = %kind, "filter changed, polling now");
                    ticker.reset_immediately();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(kind = %kind, "poll loop stopping");
                        break;
                    }
                }
            }
        }
    }
}

//! Normalized entity tables with version-gated writes.
//!
//! The store is the single source of truth for the rest of the engine. Every
//! write is gated on the record's version marker: an `upsert` or `remove`
//! carrying an older version than the one held is a no-op reported as
//! [`StoreOutcome::Stale`], without notifying subscribers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use pipeline_proto::{
    Action, CollectorAgent, DataStream, Destination, Entity, EntityKey, EntityKind,
    InstrumentationRule, Source, Version,
};
use tokio::time::Instant;

/// Where a record came from. Ordered by tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Optimistic record written by a pending mutation.
    Local,
    /// Periodic snapshot poll.
    Poll,
    /// Server push delta or authoritative mutation response.
    Push,
}

/// A stored record with its version marker.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedEntity {
    /// The record.
    pub entity: Entity,
    /// Version of the record.
    pub version: Version,
    /// Channel that delivered the record.
    pub origin: Origin,
}

impl VersionedEntity {
    /// Wrap a record.
    #[must_use]
    pub const fn new(entity: Entity, version: Version, origin: Origin) -> Self {
        Self {
            entity,
            version,
            origin,
        }
    }
}

/// Marker that a key was deleted at a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    /// Version of the delete.
    pub version: Version,
    /// When the delete was applied locally.
    pub deleted_at: Instant,
}

/// Result of a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The write changed the store and subscribers were notified.
    Applied,
    /// The write was accepted but nothing visible changed.
    Unchanged,
    /// The write carried an older version and was ignored.
    Stale,
}

/// Notification delivered to subscribers after a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// A record was inserted or replaced.
    Upserted {
        /// Entity kind.
        kind: EntityKind,
        /// Entity key.
        key: EntityKey,
        /// New version.
        version: Version,
    },
    /// A record was removed.
    Removed {
        /// Entity kind.
        kind: EntityKind,
        /// Entity key.
        key: EntityKey,
        /// Version of the delete.
        version: Version,
    },
    /// The kind completed its first successful poll.
    Baselined {
        /// Entity kind.
        kind: EntityKind,
    },
    /// The kind's baseline was dropped and its records await a fresh poll.
    BaselineReset {
        /// Entity kind.
        kind: EntityKind,
    },
}

impl StoreChange {
    /// Kind of the changed entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Upserted { kind, .. }
            | Self::Removed { kind, .. }
            | Self::Baselined { kind }
            | Self::BaselineReset { kind } => *kind,
        }
    }

    /// Key of the changed entity, if the change concerns one record.
    #[must_use]
    pub const fn key(&self) -> Option<&EntityKey> {
        match self {
            Self::Upserted { key, .. } | Self::Removed { key, .. } => Some(key),
            Self::Baselined { .. } | Self::BaselineReset { .. } => None,
        }
    }
}

/// Handle returned by [`EntityStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ChangeCallback = Arc<dyn Fn(&StoreChange) + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    kind: EntityKind,
    callback: ChangeCallback,
}

type Table = BTreeMap<EntityKey, VersionedEntity>;

/// Typed tables for every entity kind.
#[derive(Default)]
pub struct EntityStore {
    tables: HashMap<EntityKind, Table>,
    tombstones: HashMap<EntityKind, HashMap<EntityKey, Tombstone>>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    baseline: HashSet<EntityKind>,
    stale: HashSet<EntityKind>,
}

impl fmt::Debug for EntityStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("records", &self.tables.values().map(BTreeMap::len).sum::<usize>())
            .field(
                "tombstones",
                &self.tombstones.values().map(HashMap::len).sum::<usize>(),
            )
            .field("subscribers", &self.subscribers.len())
            .field("baseline", &self.baseline)
            .finish()
    }
}

impl EntityStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, kind: EntityKind, key: &EntityKey) -> Option<&VersionedEntity> {
        self.tables.get(&kind).and_then(|table| table.get(key))
    }

    /// Version currently held for a key.
    #[must_use]
    pub fn version(&self, kind: EntityKind, key: &EntityKey) -> Option<Version> {
        self.get(kind, key).map(|record| record.version)
    }

    /// Tombstone recorded for a key, if it was deleted recently.
    #[must_use]
    pub fn tombstone(&self, kind: EntityKind, key: &EntityKey) -> Option<&Tombstone> {
        self.tombstones.get(&kind).and_then(|t| t.get(key))
    }

    /// Keys currently held for a kind, in order.
    #[must_use]
    pub fn keys(&self, kind: EntityKind) -> Vec<EntityKey> {
        self.tables
            .get(&kind)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate the records of a kind in key order.
    pub fn iter(&self, kind: EntityKind) -> impl Iterator<Item = (&EntityKey, &VersionedEntity)> {
        self.tables.get(&kind).into_iter().flat_map(BTreeMap::iter)
    }

    /// Number of records of a kind.
    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.tables.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Whether the store holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }

    /// Insert or replace a record if `version` is not older than the held one.
    ///
    /// A same-version write of an identical record is reported as
    /// `Unchanged` and does not notify subscribers.
    pub fn upsert(
        &mut self,
        kind: EntityKind,
        key: EntityKey,
        entity: Entity,
        version: Version,
        origin: Origin,
    ) -> StoreOutcome {
        let table = self.tables.entry(kind).or_default();

        if let Some(current) = table.get_mut(&key) {
            if version < current.version {
                return StoreOutcome::Stale;
            }
            if version == current.version && current.entity == entity {
                current.origin = current.origin.max(origin);
                return StoreOutcome::Unchanged;
            }
        }

        table.insert(key.clone(), VersionedEntity::new(entity, version, origin));
        if let Some(tombstones) = self.tombstones.get_mut(&kind) {
            tombstones.remove(&key);
        }

        self.notify(&StoreChange::Upserted { kind, key, version });
        StoreOutcome::Applied
    }

    /// Remove a record if `version` is not older than the held one, leaving a tombstone.
    ///
    /// Removing an absent key still records the tombstone so that later
    /// stale upserts for the key are rejected.
    pub fn remove(&mut self, kind: EntityKind, key: EntityKey, version: Version) -> StoreOutcome {
        self.remove_at(kind, key, version, Instant::now())
    }

    fn remove_at(
        &mut self,
        kind: EntityKind,
        key: EntityKey,
        version: Version,
        now: Instant,
    ) -> StoreOutcome {
        let table = self.tables.entry(kind).or_default();

        if table.get(&key).is_some_and(|current| version < current.version) {
            return StoreOutcome::Stale;
        }
        let removed = table.remove(&key);

        let tombstone = self
            .tombstones
            .entry(kind)
            .or_default()
            .entry(key.clone())
            .or_insert(Tombstone {
                version,
                deleted_at: now,
            });
        if version >= tombstone.version {
            tombstone.version = version;
            tombstone.deleted_at = now;
        }

        if removed.is_some() {
            self.notify(&StoreChange::Removed { kind, key, version });
            StoreOutcome::Applied
        } else {
            StoreOutcome::Unchanged
        }
    }

    /// Roll a key back from an optimistic write to its prior state.
    ///
    /// Only succeeds while the key is still exactly at the `provisional`
    /// version written locally, either as a live `Local` record or as a
    /// tombstone. If anything newer has arrived in the meantime the rollback
    /// is `Stale` and the newer state is kept.
    pub fn restore(
        &mut self,
        kind: EntityKind,
        key: EntityKey,
        provisional: Version,
        prior: Option<VersionedEntity>,
        prior_tombstone: Option<Tombstone>,
    ) -> StoreOutcome {
        if !self.is_provisional(kind, &key, provisional) {
            return StoreOutcome::Stale;
        }

        let table = self.tables.entry(kind).or_default();
        let tombstones = self.tombstones.entry(kind).or_default();

        let removed = table.remove(&key);
        tombstones.remove(&key);
        if let Some(tombstone) = prior_tombstone {
            tombstones.insert(key.clone(), tombstone);
        }

        match prior {
            Some(record) => {
                let version = record.version;
                table.insert(key.clone(), record);
                self.notify(&StoreChange::Upserted { kind, key, version });
                StoreOutcome::Applied
            }
            None if removed.is_some() => {
                self.notify(&StoreChange::Removed {
                    kind,
                    key,
                    version: provisional,
                });
                StoreOutcome::Applied
            }
            None => StoreOutcome::Unchanged,
        }
    }

    /// Replace a provisional record with an authoritative one regardless of version order.
    ///
    /// Same precondition as [`restore`](Self::restore): returns `Stale` if the
    /// key has moved past the provisional version.
    pub fn replace_provisional(
        &mut self,
        kind: EntityKind,
        key: EntityKey,
        provisional: Version,
        record: VersionedEntity,
    ) -> StoreOutcome {
        if !self.is_provisional(kind, &key, provisional) {
            return StoreOutcome::Stale;
        }

        let version = record.version;
        self.tables
            .entry(kind)
            .or_default()
            .insert(key.clone(), record);
        if let Some(tombstones) = self.tombstones.get_mut(&kind) {
            tombstones.remove(&key);
        }

        self.notify(&StoreChange::Upserted { kind, key, version });
        StoreOutcome::Applied
    }

    /// Lower a provisional marker to `to` without touching the record's content.
    ///
    /// Used when the server accepted a mutation but did not echo the result:
    /// the optimistic state stays visible while any later server record can
    /// overwrite it. The record is no longer pending, so it is handed back to
    /// snapshot absence tracking as if it had been polled.
    pub fn demote_provisional(
        &mut self,
        kind: EntityKind,
        key: &EntityKey,
        provisional: Version,
        to: Version,
    ) -> StoreOutcome {
        if !self.is_provisional(kind, key, provisional) {
            return StoreOutcome::Stale;
        }

        if let Some(record) = self.tables.get_mut(&kind).and_then(|t| t.get_mut(key)) {
            record.version = to;
            record.origin = Origin::Poll;
        } else if let Some(tombstone) = self.tombstones.get_mut(&kind).and_then(|t| t.get_mut(key))
        {
            tombstone.version = to;
        }
        StoreOutcome::Unchanged
    }

    fn is_provisional(&self, kind: EntityKind, key: &EntityKey, provisional: Version) -> bool {
        match self.get(kind, key) {
            Some(current) => current.version == provisional && current.origin == Origin::Local,
            None => self
                .tombstone(kind, key)
                .is_some_and(|t| t.version == provisional),
        }
    }

    /// Drop tombstones recorded before `cutoff`. Returns how many were purged.
    pub fn purge_tombstones(&mut self, cutoff: Instant) -> usize {
        let mut purged = 0;
        for tombstones in self.tombstones.values_mut() {
            let before = tombstones.len();
            tombstones.retain(|_, t| t.deleted_at >= cutoff);
            purged += before - tombstones.len();
        }
        purged
    }

    /// Register a callback for changes to one kind.
    pub fn subscribe(
        &mut self,
        kind: EntityKind,
        callback: impl Fn(&StoreChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers.push(Subscriber {
            id,
            kind,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    fn notify(&self, change: &StoreChange) {
        let kind = change.kind();
        for subscriber in self.subscribers.iter().filter(|s| s.kind == kind) {
            (subscriber.callback)(change);
        }
    }

    /// Record that `kind` completed its first successful poll.
    ///
    /// Subscribers of the kind are notified the first time, since the
    /// topology changes from skeleton to real nodes.
    pub fn mark_baseline(&mut self, kind: EntityKind) -> bool {
        let first = self.baseline.insert(kind);
        if first {
            self.notify(&StoreChange::Baselined { kind });
        }
        first
    }

    /// Whether `kind` has completed a successful poll.
    #[must_use]
    pub fn has_baseline(&self, kind: EntityKind) -> bool {
        self.baseline.contains(&kind)
    }

    /// Forget every baseline. Returns the kinds that had one.
    ///
    /// Records stay in place; the topology falls back to skeleton nodes for
    /// empty layers until the next successful poll of each kind.
    pub fn reset_baselines(&mut self) -> Vec<EntityKind> {
        let mut cleared: Vec<_> = self.baseline.drain().collect();
        cleared.sort_unstable();
        for kind in &cleared {
            self.notify(&StoreChange::BaselineReset { kind: *kind });
        }
        cleared
    }

    /// Flag or clear the "last snapshot was incomplete" marker for a kind.
    pub fn set_stale(&mut self, kind: EntityKind, stale: bool) {
        if stale {
            self.stale.insert(kind);
        } else {
            self.stale.remove(&kind);
        }
    }

    /// Whether the last snapshot for `kind` was incomplete.
    #[must_use]
    pub fn is_stale(&self, kind: EntityKind) -> bool {
        self.stale.contains(&kind)
    }

    /// Owned copy of every table for read-only consumers.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tables: self.tables.clone(),
            baseline: self.baseline.clone(),
            stale: self.stale.clone(),
        }
    }
}

/// An owned, read-only copy of the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    tables: HashMap<EntityKind, Table>,
    baseline: HashSet<EntityKind>,
    stale: HashSet<EntityKind>,
}

impl StoreSnapshot {
    /// Empty snapshot with no baselines.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record (keyed by the entity's own key).
    #[must_use]
    pub fn with_entity(mut self, entity: Entity, version: Version) -> Self {
        self.tables
            .entry(entity.kind())
            .or_default()
            .insert(entity.key(), VersionedEntity::new(entity, version, Origin::Poll));
        self
    }

    /// Mark a kind as having completed its baseline poll.
    #[must_use]
    pub fn with_baseline(mut self, kind: EntityKind) -> Self {
        self.baseline.insert(kind);
        self
    }

    /// Mark every kind as baselined.
    #[must_use]
    pub fn with_all_baselines(mut self) -> Self {
        self.baseline.extend(EntityKind::ALL);
        self
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, kind: EntityKind, key: &EntityKey) -> Option<&VersionedEntity> {
        self.tables.get(&kind).and_then(|table| table.get(key))
    }

    /// Records of a kind in key order.
    pub fn entities(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.tables
            .get(&kind)
            .into_iter()
            .flat_map(BTreeMap::values)
            .map(|record| &record.entity)
    }

    /// Number of records of a kind.
    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.tables.get(&kind).map_or(0, BTreeMap::len)
    }

    /// Whether the snapshot holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }

    /// Whether `kind` completed a baseline poll.
    #[must_use]
    pub fn has_baseline(&self, kind: EntityKind) -> bool {
        self.baseline.contains(&kind)
    }

    /// Whether the last snapshot of `kind` was incomplete.
    #[must_use]
    pub fn is_stale(&self, kind: EntityKind) -> bool {
        self.stale.contains(&kind)
    }

    /// All sources.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.entities(EntityKind::Source).filter_map(|e| match e {
            Entity::Source(s) => Some(s),
            _ => None,
        })
    }

    /// All destinations.
    pub fn destinations(&self) -> impl Iterator<Item = &Destination> {
        self.entities(EntityKind::Destination).filter_map(|e| match e {
            Entity::Destination(d) => Some(d),
            _ => None,
        })
    }

    /// All actions.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.entities(EntityKind::Action).filter_map(|e| match e {
            Entity::Action(a) => Some(a),
            _ => None,
        })
    }

    /// All instrumentation rules.
    pub fn rules(&self) -> impl Iterator<Item = &InstrumentationRule> {
        self.entities(EntityKind::InstrumentationRule)
            .filter_map(|e| match e {
                Entity::InstrumentationRule(r) => Some(r),
                _ => None,
            })
    }

    /// All collector pods.
    pub fn collectors(&self) -> impl Iterator<Item = &CollectorAgent> {
        self.entities(EntityKind::CollectorAgent)
            .filter_map(|e| match e {
                Entity::CollectorAgent(c) => Some(c),
                _ => None,
            })
    }

    /// All data streams.
    pub fn data_streams(&self) -> impl Iterator<Item = &DataStream> {
        self.entities(EntityKind::DataStream).filter_map(|e| match e {
            Entity::DataStream(s) => Some(s),
            _ => None,
        })
    }
}

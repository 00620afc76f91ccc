//! Merging of push deltas, snapshot records and optimistic writes.
//!
//! The [`Reconciler`] is the only component that writes to the
//! [`EntityStore`]. Every write goes through the same rules:
//!
//! 1. A delete applies when its version is at least the held version, and
//!    leaves a tombstone at that version.
//! 2. A create or update is dropped when a tombstone with an equal or higher
//!    version exists, and otherwise applies when its version is at least the
//!    held version.
//! 3. Ties at an equal version go to the higher [`Origin`]: push beats poll,
//!    and both beat a local provisional record.
//!
//! Because each rule depends only on version markers, applying the same
//! input twice is a no-op and any interleaving of the same inputs converges.

use std::time::Duration;

use parking_lot::Mutex;
use pipeline_proto::{
    Delta, Entity, EntityKey, EntityKind, Op, PushMessage, QueryFilter, SnapshotRecord, Version,
};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{SyncError, SyncResult};
use crate::store::{
    EntityStore, Origin, StoreChange, StoreOutcome, StoreSnapshot, SubscriptionId, Tombstone,
    VersionedEntity,
};

/// What the reconciler did with one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The store changed.
    Applied,
    /// The input matched what was already held.
    Unchanged,
    /// The input was older than the held version.
    Stale,
    /// The input would resurrect a deleted key.
    Tombstoned,
    /// The input tied on version but came from a lower-priority origin.
    LostTie,
}

impl Decision {
    /// Whether the input changed the store.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

impl From<StoreOutcome> for Decision {
    fn from(outcome: StoreOutcome) -> Self {
        match outcome {
            StoreOutcome::Applied => Self::Applied,
            StoreOutcome::Unchanged => Self::Unchanged,
            StoreOutcome::Stale => Self::Stale,
        }
    }
}

/// Bookkeeping for an optimistic write, needed to settle or revert it.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisional {
    kind: EntityKind,
    key: EntityKey,
    op: Op,
    version: Version,
    last_known: Version,
    prior: Option<VersionedEntity>,
    prior_tombstone: Option<Tombstone>,
}

impl Provisional {
    /// Kind of the staged entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Key of the staged entity.
    #[must_use]
    pub const fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Operation that was staged.
    #[must_use]
    pub const fn op(&self) -> Op {
        self.op
    }

    /// The locally synthesized version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// The record held before the optimistic write.
    #[must_use]
    pub const fn prior(&self) -> Option<&VersionedEntity> {
        self.prior.as_ref()
    }
}

/// Sole writer of the entity store.
#[derive(Debug)]
pub struct Reconciler {
    store: Mutex<EntityStore>,
    tombstone_retention: Duration,
}

impl Reconciler {
    /// Create a reconciler over an empty store.
    #[must_use]
    pub fn new(tombstone_retention: Duration) -> Self {
        Self::with_store(EntityStore::new(), tombstone_retention)
    }

    /// Create a reconciler over an existing store.
    #[must_use]
    pub const fn with_store(store: EntityStore, tombstone_retention: Duration) -> Self {
        Self {
            store: Mutex::new(store),
            tombstone_retention,
        }
    }

    /// Apply one delta.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the delta is malformed. Stale,
    /// tombstoned and tie-losing inputs are not errors.
    pub fn apply(&self, delta: Delta, origin: Origin) -> SyncResult<Decision> {
        delta.validate()?;

        let kind = delta.kind;
        let key = delta.key.clone();
        let version = delta.version;
        let decision = {
            let mut store = self.store.lock();
            Self::decide(&mut store, delta, origin)
        };

        if decision.is_applied() {
            debug!(kind = %kind, key = %key, version = %version, ?origin, "applied");
        } else {
            trace!(kind = %kind, key = %key, version = %version, ?origin, ?decision, "skipped");
        }
        Ok(decision)
    }

    /// Decode and apply a raw push message.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the message is malformed.
    pub fn apply_message(&self, message: PushMessage) -> SyncResult<Decision> {
        let delta = message.into_delta()?;
        self.apply(delta, Origin::Push)
    }

    fn decide(store: &mut EntityStore, delta: Delta, origin: Origin) -> Decision {
        let Delta {
            kind,
            key,
            version,
            entity,
            ..
        } = delta;

        let Some(entity) = entity else {
            return store.remove(kind, key, version).into();
        };

        if store
            .tombstone(kind, &key)
            .is_some_and(|t| t.version >= version)
        {
            return Decision::Tombstoned;
        }

        if let Some(current) = store.get(kind, &key) {
            if version < current.version {
                return Decision::Stale;
            }
            if version == current.version && origin < current.origin {
                return Decision::LostTie;
            }
        }

        store.upsert(kind, key, entity, version, origin).into()
    }

    /// Apply an optimistic local write and remember how to undo it.
    ///
    /// The provisional version is one past the last known version of the key,
    /// counting tombstones, so it always supersedes what is held.
    pub fn stage(&self, kind: EntityKind, key: EntityKey, entity: Option<Entity>) -> Provisional {
        let mut store = self.store.lock();

        let prior = store.get(kind, &key).cloned();
        let prior_tombstone = store.tombstone(kind, &key).copied();
        let last_known = prior
            .as_ref()
            .map(|r| r.version)
            .max(prior_tombstone.map(|t| t.version))
            .unwrap_or(Version::ZERO);
        let version = last_known.next();

        let op = match entity {
            Some(entity) => {
                let op = if prior.is_some() { Op::Update } else { Op::Create };
                store.upsert(kind, key.clone(), entity, version, Origin::Local);
                op
            }
            None => {
                store.remove(kind, key.clone(), version);
                Op::Delete
            }
        };
        drop(store);

        debug!(kind = %kind, key = %key, version = %version, "staged optimistic write");
        Provisional {
            kind,
            key,
            op,
            version,
            last_known,
            prior,
            prior_tombstone,
        }
    }

    /// Roll back an optimistic write. Returns whether the rollback happened.
    ///
    /// Nothing is rolled back if a newer server record already replaced the
    /// provisional one.
    pub fn revert(&self, provisional: Provisional) -> bool {
        let Provisional {
            kind,
            key,
            version,
            prior,
            prior_tombstone,
            ..
        } = provisional;

        let outcome = self
            .store
            .lock()
            .restore(kind, key.clone(), version, prior, prior_tombstone);

        debug!(kind = %kind, key = %key, version = %version, ?outcome, "reverted optimistic write");
        outcome != StoreOutcome::Stale
    }

    /// Replace an optimistic write with the server's authoritative record.
    ///
    /// The server record wins even when its version is lower than the
    /// provisional one. Without a record the provisional state is kept but
    /// its version is lowered back to the last known one, so the next server
    /// record for the key takes over.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Validation`] if the record describes a different
    /// entity or is malformed.
    pub fn settle(
        &self,
        provisional: &Provisional,
        record: Option<SnapshotRecord>,
    ) -> SyncResult<Decision> {
        let kind = provisional.kind;
        let key = &provisional.key;

        let record = match record {
            Some(record) if provisional.op.is_upsert() => record,
            _ => {
                let outcome = self.store.lock().demote_provisional(
                    kind,
                    key,
                    provisional.version,
                    provisional.last_known,
                );
                return Ok(outcome.into());
            }
        };

        let delta = Delta::upsert(provisional.op, record.version, record.entity);
        if delta.kind != kind || delta.key != *key {
            return Err(SyncError::Validation(format!(
                "mutation response for {} {} does not match {kind} {key}",
                delta.kind, delta.key
            )));
        }
        delta.validate()?;

        let Delta {
            version, entity, ..
        } = delta;
        let Some(entity) = entity else {
            return Ok(Decision::Unchanged);
        };

        let outcome = self.store.lock().replace_provisional(
            kind,
            key.clone(),
            provisional.version,
            VersionedEntity::new(entity.clone(), version, Origin::Push),
        );
        if outcome != StoreOutcome::Stale {
            debug!(kind = %kind, key = %key, version = %version, "settled optimistic write");
            return Ok(outcome.into());
        }

        // A newer server record already replaced the provisional one.
        self.apply(Delta::upsert(provisional.op, version, entity), Origin::Push)
    }

    /// Drop tombstones older than the retention window.
    pub fn purge_expired_tombstones(&self) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(self.tombstone_retention) else {
            return 0;
        };
        let purged = self.store.lock().purge_tombstones(cutoff);
        if purged > 0 {
            debug!(purged, "purged expired tombstones");
        }
        purged
    }

    /// Record that `kind` completed a successful poll.
    pub fn mark_baseline(&self, kind: EntityKind) -> bool {
        self.store.lock().mark_baseline(kind)
    }

    /// Whether `kind` completed a successful poll.
    #[must_use]
    pub fn has_baseline(&self, kind: EntityKind) -> bool {
        self.store.lock().has_baseline(kind)
    }

    /// Forget every baseline. Returns the kinds that had one.
    pub fn reset_baselines(&self) -> Vec<EntityKind> {
        self.store.lock().reset_baselines()
    }

    /// Flag or clear the incomplete-snapshot marker for `kind`.
    pub fn set_stale(&self, kind: EntityKind, stale: bool) {
        self.store.lock().set_stale(kind, stale);
    }

    /// Whether the last snapshot for `kind` was incomplete.
    #[must_use]
    pub fn is_stale(&self, kind: EntityKind) -> bool {
        self.store.lock().is_stale(kind)
    }

    /// Owned copy of the store.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.lock().snapshot()
    }

    /// Copy of one record.
    #[must_use]
    pub fn get(&self, kind: EntityKind, key: &EntityKey) -> Option<VersionedEntity> {
        self.store.lock().get(kind, key).cloned()
    }

    /// Keys and versions of the server-sourced records of `kind` the filter selects.
    ///
    /// Provisional records of pending mutations are left out.
    #[must_use]
    pub fn keys_matching(&self, kind: EntityKind, filter: &QueryFilter) -> Vec<(EntityKey, Version)> {
        self.store
            .lock()
            .iter(kind)
            .filter(|(_, record)| record.origin != Origin::Local && filter.matches(&record.entity))
            .map(|(key, record)| (key.clone(), record.version))
            .collect()
    }

    /// Register a change callback for one kind.
    ///
    /// The callback runs while the store is locked and must not call back
    /// into the reconciler.
    pub fn subscribe(
        &self,
        kind: EntityKind,
        callback: impl Fn(&StoreChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.store.lock().subscribe(kind, callback)
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.lock().unsubscribe(id)
    }
}

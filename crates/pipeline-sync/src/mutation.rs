//! Optimistic user writes.
//!
//! A mutation is applied to the store right away with a provisional version,
//! then submitted to the server. The server's answer either settles the
//! provisional record into the authoritative one or rolls it back. Only one
//! mutation per entity may be in flight; a second one fails fast with
//! [`SyncError::Conflict`] and is never retried automatically.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use pipeline_proto::{
    Entity, EntityKey, EntityKind, MutationRequest, MutationResponse, Op, SnapshotRecord,
};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::reconciler::{Provisional, Reconciler};

/// Sends mutations to the server.
pub trait MutationTransport: Send + Sync + 'static {
    /// Submit one mutation and wait for the server's answer.
    fn submit(
        &self,
        request: MutationRequest,
    ) -> impl Future<Output = SyncResult<MutationResponse>> + Send;
}

type InFlight = Arc<Mutex<HashSet<(EntityKind, EntityKey)>>>;

/// Releases the per-key in-flight slot on drop.
struct InFlightGuard {
    in_flight: InFlight,
    entry: (EntityKind, EntityKey),
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.entry);
    }
}

/// An optimistic write awaiting the server. Reverted on drop unless settled,
/// so a cancelled mutation never leaves a provisional record behind.
struct StagedWrite<'a> {
    reconciler: &'a Reconciler,
    provisional: Option<Provisional>,
}

impl StagedWrite<'_> {
    /// Settle with the server's record. A malformed record keeps the
    /// optimistic state at the last known version instead.
    fn settle(mut self, record: Option<SnapshotRecord>) -> SyncResult<()> {
        let Some(provisional) = self.provisional.take() else {
            return Ok(());
        };
        match self.reconciler.settle(&provisional, record) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.reconciler.settle(&provisional, None)?;
                Err(e)
            }
        }
    }

    fn revert(mut self) {
        if let Some(provisional) = self.provisional.take() {
            self.reconciler.revert(provisional);
        }
    }
}

impl Drop for StagedWrite<'_> {
    fn drop(&mut self) {
        if let Some(provisional) = self.provisional.take() {
            debug!(kind = %provisional.kind(), key = %provisional.key(), "mutation abandoned");
            self.reconciler.revert(provisional);
        }
    }
}

/// Applies user writes optimistically and reconciles them with the server.
pub struct MutationCoordinator<M> {
    transport: M,
    reconciler: Arc<Reconciler>,
    in_flight: InFlight,
}

impl<M: MutationTransport> MutationCoordinator<M> {
    /// Create a coordinator.
    #[must_use]
    pub fn new(transport: M, reconciler: Arc<Reconciler>) -> Self {
        Self {
            transport,
            reconciler,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create an entity. Returns the server's authoritative record, if it sent one.
    ///
    /// # Errors
    ///
    /// See [`MutationCoordinator::delete`].
    pub async fn create(&self, entity: Entity) -> SyncResult<Option<SnapshotRecord>> {
        let kind = entity.kind();
        let key = entity.key();
        self.mutate(kind, key, Op::Create, Some(entity)).await
    }

    /// Replace an entity. Returns the server's authoritative record, if it sent one.
    ///
    /// # Errors
    ///
    /// See [`MutationCoordinator::delete`].
    pub async fn update(&self, entity: Entity) -> SyncResult<Option<SnapshotRecord>> {
        let kind = entity.kind();
        let key = entity.key();
        self.mutate(kind, key, Op::Update, Some(entity)).await
    }

    /// Delete an entity.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] for kinds users cannot change, profile
    ///   managed rules, and malformed payloads.
    /// - [`SyncError::Conflict`] if another mutation on the key is in flight.
    /// - [`SyncError::Rejected`] if the server refused the mutation.
    /// - [`SyncError::Transport`] if the server could not be reached.
    ///
    /// The optimistic change is rolled back on every error after submission.
    pub async fn delete(&self, kind: EntityKind, key: EntityKey) -> SyncResult<Option<SnapshotRecord>> {
        self.mutate(kind, key, Op::Delete, None).await
    }

    /// Whether a mutation on the key is in flight.
    #[must_use]
    pub fn is_in_flight(&self, kind: EntityKind, key: &EntityKey) -> bool {
        self.in_flight.lock().contains(&(kind, key.clone()))
    }

    async fn mutate(
        &self,
        kind: EntityKind,
        key: EntityKey,
        op: Op,
        entity: Option<Entity>,
    ) -> SyncResult<Option<SnapshotRecord>> {
        self.check(kind, &key, op, entity.as_ref())?;
        let _guard = self.acquire(kind, &key)?;

        let staged = StagedWrite {
            reconciler: &self.reconciler,
            provisional: Some(self.reconciler.stage(kind, key.clone(), entity.clone())),
        };
        let request = MutationRequest {
            kind,
            key: key.clone(),
            op,
            payload: entity,
        };

        match self.transport.submit(request).await {
            Ok(MutationResponse {
                accepted: true,
                record,
                ..
            }) => {
                if let Err(e) = staged.settle(record.clone()) {
                    warn!(kind = %kind, key = %key, error = %e, "ignoring malformed mutation response");
                    return Ok(None);
                }
                info!(kind = %kind, key = %key, ?op, "mutation accepted");
                Ok(record)
            }
            Ok(MutationResponse { error, .. }) => {
                staged.revert();
                let reason = error.unwrap_or_else(|| "no reason given".to_string());
                warn!(kind = %kind, key = %key, ?op, reason = %reason, "mutation rejected");
                Err(SyncError::Rejected { kind, key, reason })
            }
            Err(e) => {
                staged.revert();
                warn!(kind = %kind, key = %key, ?op, error = %e, "mutation failed");
                Err(e)
            }
        }
    }

    fn check(&self, kind: EntityKind, key: &EntityKey, op: Op, entity: Option<&Entity>) -> SyncResult<()> {
        if !kind.is_user_mutable() {
            return Err(SyncError::Validation(format!("{kind} records are read-only")));
        }
        if !key.fits(kind) {
            return Err(SyncError::Validation(format!("{key} is not a {kind} key")));
        }
        if let Some(entity) = entity {
            entity.validate()?;
        }

        if op != Op::Create && kind == EntityKind::InstrumentationRule {
            let locked = self
                .reconciler
                .get(kind, key)
                .is_some_and(|held| matches!(held.entity, Entity::InstrumentationRule(ref r) if !r.mutable));
            if locked {
                return Err(SyncError::Validation(format!(
                    "instrumentation rule {key} is managed by a profile and cannot be changed"
                )));
            }
        }
        Ok(())
    }

    fn acquire(&self, kind: EntityKind, key: &EntityKey) -> SyncResult<InFlightGuard> {
        let entry = (kind, key.clone());
        if !self.in_flight.lock().insert(entry.clone()) {
            return Err(SyncError::Conflict {
                kind,
                key: key.clone(),
            });
        }
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            entry,
        })
    }
}

//! Push, snapshot and mutation message contracts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::Entity;
use crate::error::ProtoError;
use crate::types::{EntityKey, EntityKind, Version};

/// Operation carried by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// The entity was created.
    Create,
    /// The entity changed.
    Update,
    /// The entity was deleted.
    Delete,
}

impl Op {
    /// Whether this op carries a record.
    #[must_use]
    pub const fn is_upsert(self) -> bool {
        matches!(self, Self::Create | Self::Update)
    }
}

/// A raw message from the server event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Entity kind.
    pub kind: EntityKind,
    /// Text form of the entity key.
    pub key: String,
    /// Operation.
    pub op: Op,
    /// Server version of the change.
    pub version: Version,
    /// Record payload, required for create and update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PushMessage {
    /// Parse a message from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a well-formed message envelope.
    pub fn from_json(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(|e| ProtoError::Decoding(e.to_string()))
    }

    /// Serialize the message to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Decode the payload and check it against the envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed, the payload is missing or
    /// does not decode, or the payload describes a different entity.
    pub fn into_delta(self) -> Result<Delta, ProtoError> {
        let key = EntityKey::parse(self.kind, &self.key)?;
        let entity = match (self.op.is_upsert(), self.payload) {
            (true, Some(payload)) => Some(Entity::from_payload(self.kind, payload)?),
            (true, None) => return Err(ProtoError::MissingField("payload")),
            (false, _) => None,
        };

        let delta = Delta {
            kind: self.kind,
            key,
            version: self.version,
            op: self.op,
            entity,
        };
        delta.validate()?;
        Ok(delta)
    }
}

/// A decoded change for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity key.
    pub key: EntityKey,
    /// Version of the change.
    pub version: Version,
    /// Operation.
    pub op: Op,
    /// New record for create and update.
    pub entity: Option<Entity>,
}

impl Delta {
    /// An upsert of `entity` at `version`.
    #[must_use]
    pub fn upsert(op: Op, version: Version, entity: Entity) -> Self {
        Self {
            kind: entity.kind(),
            key: entity.key(),
            version,
            op,
            entity: Some(entity),
        }
    }

    /// A delete of `key` at `version`.
    #[must_use]
    pub const fn delete(kind: EntityKind, key: EntityKey, version: Version) -> Self {
        Self {
            kind,
            key,
            version,
            op: Op::Delete,
            entity: None,
        }
    }

    /// Check that the key, op and record agree.
    ///
    /// # Errors
    ///
    /// Returns an error on any mismatch or if the record fails validation.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if !self.key.fits(self.kind) {
            return Err(ProtoError::InvalidKey {
                kind: self.kind.to_string(),
                reason: format!("key {} has the wrong shape", self.key),
            });
        }

        match (&self.entity, self.op) {
            (None, Op::Delete) => Ok(()),
            (Some(_), Op::Delete) => Err(ProtoError::Validation(
                "delete must not carry a record".to_string(),
            )),
            (None, _) => Err(ProtoError::MissingField("payload")),
            (Some(entity), _) => {
                if entity.kind() != self.kind {
                    return Err(ProtoError::Validation(format!(
                        "payload is a {} but the message is for a {}",
                        entity.kind(),
                        self.kind
                    )));
                }
                let entity_key = entity.key();
                if entity_key != self.key {
                    return Err(ProtoError::Validation(format!(
                        "payload key {entity_key} does not match message key {}",
                        self.key
                    )));
                }
                entity.validate()
            }
        }
    }
}

/// One record of a snapshot, or an authoritative mutation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Server version of the record.
    pub version: Version,
    /// The record.
    pub entity: Entity,
}

impl SnapshotRecord {
    /// Create a snapshot record.
    #[must_use]
    pub const fn new(version: Version, entity: Entity) -> Self {
        Self { version, entity }
    }
}

/// A full list of records of one kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Kind of every record.
    pub kind: EntityKind,
    /// Records.
    pub records: Vec<SnapshotRecord>,
    /// False when the server flagged the list as an incomplete subset.
    #[serde(default = "complete_by_default")]
    pub complete: bool,
}

const fn complete_by_default() -> bool {
    true
}

impl Snapshot {
    /// A complete snapshot.
    #[must_use]
    pub const fn complete(kind: EntityKind, records: Vec<SnapshotRecord>) -> Self {
        Self {
            kind,
            records,
            complete: true,
        }
    }

    /// A snapshot the server flagged as incomplete.
    #[must_use]
    pub const fn partial(kind: EntityKind, records: Vec<SnapshotRecord>) -> Self {
        Self {
            kind,
            records,
            complete: false,
        }
    }
}

/// Kind-specific filters for a pull query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    /// Restrict sources to one namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Restrict sources and destinations to one data stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

impl QueryFilter {
    /// A filter matching everything.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            namespace: None,
            stream: None,
        }
    }

    /// A filter for one data stream.
    #[must_use]
    pub fn stream(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            stream: Some(name.into()),
        }
    }

    /// Restrict to one namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Whether the server would include `entity` in a response for this filter.
    ///
    /// Only sources and destinations are filtered; other kinds always match.
    #[must_use]
    pub fn matches(&self, entity: &Entity) -> bool {
        let stream_ok = |streams: &[String]| {
            self.stream
                .as_ref()
                .is_none_or(|wanted| streams.iter().any(|s| s == wanted))
        };

        match entity {
            Entity::Source(source) => {
                self.namespace
                    .as_ref()
                    .is_none_or(|ns| *ns == source.id.namespace)
                    && stream_ok(&source.data_streams)
            }
            Entity::Destination(destination) => stream_ok(&destination.data_streams),
            _ => true,
        }
    }
}

/// A user-initiated write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationRequest {
    /// Entity kind.
    pub kind: EntityKind,
    /// Entity key.
    pub key: EntityKey,
    /// Operation.
    pub op: Op,
    /// New record for create and update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Entity>,
}

/// The server's answer to a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    /// Whether the server applied the mutation.
    pub accepted: bool,
    /// Authoritative record after the mutation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<SnapshotRecord>,
    /// Rejection reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MutationResponse {
    /// An accepted response carrying the authoritative record.
    #[must_use]
    pub const fn accepted(record: Option<SnapshotRecord>) -> Self {
        Self {
            accepted: true,
            record,
            error: None,
        }
    }

    /// A rejected response.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            record: None,
            error: Some(reason.into()),
        }
    }
}

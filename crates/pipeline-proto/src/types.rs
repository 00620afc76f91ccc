//! Core identity, versioning and health types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// The kinds of entity tracked by the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// An instrumented workload.
    Source,
    /// An export target for telemetry.
    Destination,
    /// A pipeline transform applied by the gateway.
    Action,
    /// A rule applied to a filtered subset of sources.
    InstrumentationRule,
    /// A collector pod (node-level agent or gateway replica).
    CollectorAgent,
    /// A named grouping of sources and destinations.
    DataStream,
}

impl EntityKind {
    /// Every kind, in a stable order.
    pub const ALL: [Self; 6] = [
        Self::Source,
        Self::Destination,
        Self::Action,
        Self::InstrumentationRule,
        Self::CollectorAgent,
        Self::DataStream,
    ];

    /// Stable lowercase name used in logs and wire messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Destination => "destination",
            Self::Action => "action",
            Self::InstrumentationRule => "instrumentation_rule",
            Self::CollectorAgent => "collector_agent",
            Self::DataStream => "data_stream",
        }
    }

    /// Whether users may create, update or delete entities of this kind.
    #[must_use]
    pub const fn is_user_mutable(self) -> bool {
        matches!(
            self,
            Self::Source | Self::Destination | Self::Action | Self::InstrumentationRule
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtoError::Validation(format!("unknown entity kind: {s}")))
    }
}

/// Kubernetes workload kinds that can be instrumented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// apps/v1 Deployment.
    Deployment,
    /// apps/v1 StatefulSet.
    StatefulSet,
    /// apps/v1 DaemonSet.
    DaemonSet,
    /// batch/v1 CronJob.
    CronJob,
    /// batch/v1 Job.
    Job,
    /// A whole namespace.
    Namespace,
}

impl WorkloadKind {
    /// Canonical kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::CronJob => "CronJob",
            Self::Job => "Job",
            Self::Namespace => "Namespace",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkloadKind {
    type Err = ProtoError;

    /// Accepts the canonical names case-insensitively plus the common
    /// short forms (`dep`, `sts`, `ds`, `cj`, `ns`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deployment" | "deploy" | "dep" => Ok(Self::Deployment),
            "statefulset" | "sts" => Ok(Self::StatefulSet),
            "daemonset" | "ds" => Ok(Self::DaemonSet),
            "cronjob" | "cj" => Ok(Self::CronJob),
            "job" => Ok(Self::Job),
            "namespace" | "ns" => Ok(Self::Namespace),
            _ => Err(ProtoError::Validation(format!("unknown workload kind: {s}"))),
        }
    }
}

/// Identity of a source workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId {
    /// Namespace the workload lives in.
    pub namespace: String,
    /// Workload kind.
    pub kind: WorkloadKind,
    /// Workload name.
    pub name: String,
}

impl SourceId {
    /// Create a new source id.
    #[must_use]
    pub fn new(namespace: impl Into<String>, kind: WorkloadKind, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kind,
            name: name.into(),
        }
    }

    /// Check that every component is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace or name is empty.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(ProtoError::InvalidKey {
                kind: EntityKind::Source.to_string(),
                reason: format!("empty namespace or name in {self}"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl FromStr for SourceId {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ProtoError::InvalidKey {
            kind: EntityKind::Source.to_string(),
            reason,
        };

        let mut parts = s.split('/');
        let (Some(namespace), Some(kind), Some(name), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid(format!("expected namespace/kind/name, got {s:?}")));
        };

        let kind = kind.parse::<WorkloadKind>().map_err(|e| invalid(e.to_string()))?;
        let id = Self::new(namespace, kind, name);
        id.validate()?;
        Ok(id)
    }
}

/// Key of an entity, unique within its kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    /// Sources are keyed by their workload identity.
    Source(SourceId),
    /// Every other kind is keyed by a single name or id.
    Name(String),
}

impl EntityKey {
    /// Key for a named entity.
    #[must_use]
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Parse the text form of a key for the given kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is empty or, for sources, not of the
    /// form `namespace/kind/name`.
    pub fn parse(kind: EntityKind, text: &str) -> Result<Self, ProtoError> {
        match kind {
            EntityKind::Source => text.parse().map(Self::Source),
            _ if text.trim().is_empty() => Err(ProtoError::InvalidKey {
                kind: kind.to_string(),
                reason: "key is empty".to_string(),
            }),
            _ => Ok(Self::Name(text.to_string())),
        }
    }

    /// Whether this key has the right shape for `kind`.
    #[must_use]
    pub const fn fits(&self, kind: EntityKind) -> bool {
        match self {
            Self::Source(_) => matches!(kind, EntityKind::Source),
            Self::Name(_) => !matches!(kind, EntityKind::Source),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(id) => id.fmt(f),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<SourceId> for EntityKey {
    fn from(id: SourceId) -> Self {
        Self::Source(id)
    }
}

impl Serialize for EntityKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Server-assigned version marker (timestamp or sequence number).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// The lowest possible version.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw version value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next version after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Status of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// Status is not known yet.
    #[default]
    Unknown,
}

/// A health condition reported for an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition type (e.g. "AgentEnabled", "DestinationReachable").
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Current status.
    pub status: ConditionStatus,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last time the condition transitioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Create a new condition without message or timestamp.
    #[must_use]
    pub fn new(condition_type: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            message: None,
            last_transition_time: None,
        }
    }

    /// Set the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Set the transition time.
    #[must_use]
    pub const fn at(mut self, time: DateTime<Utc>) -> Self {
        self.last_transition_time = Some(time);
        self
    }
}

/// Derived health, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// No condition reports a failure.
    Healthy,
    /// At least one condition reports a failure.
    Unhealthy,
}

impl Health {
    /// Derive health from an ordered condition list.
    #[must_use]
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        if conditions
            .iter()
            .any(|c| c.status == ConditionStatus::False)
        {
            Self::Unhealthy
        } else {
            Self::Healthy
        }
    }

    /// The most severe health in `healths`, `Healthy` when empty.
    #[must_use]
    pub fn worst(healths: impl IntoIterator<Item = Self>) -> Self {
        healths.into_iter().max().unwrap_or(Self::Healthy)
    }

    /// Whether this is `Healthy`.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// Telemetry signal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Distributed traces.
    Traces,
    /// Metrics.
    Metrics,
    /// Logs.
    Logs,
}

/// Programming languages detected in containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// Java.
    Java,
    /// Python.
    Python,
    /// Go.
    Go,
    /// JavaScript / Node.js.
    JavaScript,
    /// .NET.
    DotNet,
    /// PHP.
    Php,
    /// Ruby.
    Ruby,
    /// Rust.
    Rust,
    /// C++.
    Cplusplus,
    /// Nginx.
    Nginx,
    /// Language was not detected.
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_entity_kind_roundtrip_str() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("pods".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_kind_serde_matches_as_str() {
        for kind in EntityKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_user_mutable_kinds() {
        assert!(EntityKind::Source.is_user_mutable());
        assert!(EntityKind::InstrumentationRule.is_user_mutable());
        assert!(!EntityKind::CollectorAgent.is_user_mutable());
        assert!(!EntityKind::DataStream.is_user_mutable());
    }

    #[test_case("dep", WorkloadKind::Deployment)]
    #[test_case("Deployment", WorkloadKind::Deployment)]
    #[test_case("sts", WorkloadKind::StatefulSet)]
    #[test_case("DAEMONSET", WorkloadKind::DaemonSet)]
    #[test_case("cronjob", WorkloadKind::CronJob)]
    fn test_workload_kind_parse(input: &str, expected: WorkloadKind) {
        assert_eq!(input.parse::<WorkloadKind>().unwrap(), expected);
    }

    #[test]
    fn test_source_id_parse_and_display() {
        let id: SourceId = "nsA/dep/x".parse().unwrap();
        assert_eq!(id, SourceId::new("nsA", WorkloadKind::Deployment, "x"));
        assert_eq!(id.to_string(), "nsA/Deployment/x");

        let reparsed: SourceId = id.to_string().parse().unwrap();
        assert_eq!(reparsed, id);
    }

    #[test_case("nsA/dep" ; "too few parts")]
    #[test_case("nsA/dep/x/y" ; "too many parts")]
    #[test_case("/dep/x" ; "empty namespace")]
    #[test_case("nsA/dep/" ; "empty name")]
    #[test_case("nsA/pod/x" ; "unknown kind")]
    fn test_source_id_parse_rejects(input: &str) {
        assert!(input.parse::<SourceId>().is_err());
    }

    #[test]
    fn test_entity_key_parse_by_kind() {
        let key = EntityKey::parse(EntityKind::Source, "default/Deployment/cart").unwrap();
        assert!(matches!(key, EntityKey::Source(_)));
        assert!(key.fits(EntityKind::Source));
        assert!(!key.fits(EntityKind::Destination));

        let key = EntityKey::parse(EntityKind::Destination, "odigos.io.dest.jaeger-abc").unwrap();
        assert_eq!(key, EntityKey::name("odigos.io.dest.jaeger-abc"));
        assert!(key.fits(EntityKind::Destination));
        assert!(!key.fits(EntityKind::Source));

        assert!(EntityKey::parse(EntityKind::Action, "  ").is_err());
        assert!(EntityKey::parse(EntityKind::Source, "not-a-source").is_err());
    }

    #[test]
    fn test_entity_key_serializes_as_text() {
        let key = EntityKey::Source(SourceId::new("shop", WorkloadKind::StatefulSet, "db"));
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"shop/StatefulSet/db\"");
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::new(5) < Version::new(7));
        assert_eq!(Version::new(5).next(), Version::new(6));
        assert_eq!(Version::new(u64::MAX).next(), Version::new(u64::MAX));
        assert_eq!(Version::ZERO, Version::default());
        assert_eq!(Version::new(3).to_string(), "v3");
    }

    #[test]
    fn test_health_from_conditions() {
        assert_eq!(Health::from_conditions(&[]), Health::Healthy);

        let ok = Condition::new("AgentEnabled", ConditionStatus::True);
        let unknown = Condition::new("RolloutDone", ConditionStatus::Unknown);
        assert_eq!(
            Health::from_conditions(&[ok.clone(), unknown]),
            Health::Healthy
        );

        let failed = Condition::new("Reachable", ConditionStatus::False).with_message("timeout");
        assert_eq!(Health::from_conditions(&[ok, failed]), Health::Unhealthy);
    }

    #[test]
    fn test_health_worst() {
        assert_eq!(Health::worst([]), Health::Healthy);
        assert_eq!(
            Health::worst([Health::Healthy, Health::Unhealthy, Health::Healthy]),
            Health::Unhealthy
        );
    }

    #[test]
    fn test_condition_serde_uses_type_field() {
        let json = r#"{"type":"AgentEnabled","status":"False","message":"no runtime"}"#;
        let condition: Condition = serde_json::from_str(json).unwrap();

        assert_eq!(condition.condition_type, "AgentEnabled");
        assert_eq!(condition.status, ConditionStatus::False);
        assert!(condition.last_transition_time.is_none());
    }

    #[test]
    fn test_unknown_language_falls_back() {
        let lang: Language = serde_json::from_str("\"cobol\"").unwrap();
        assert_eq!(lang, Language::Unknown);
        let lang: Language = serde_json::from_str("\"python\"").unwrap();
        assert_eq!(lang, Language::Python);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn source_id_text_roundtrip(
                ns in "[a-z][a-z0-9-]{0,15}",
                name in "[a-z][a-z0-9-]{0,15}",
                idx in 0usize..6,
            ) {
                let kinds = [
                    WorkloadKind::Deployment,
                    WorkloadKind::StatefulSet,
                    WorkloadKind::DaemonSet,
                    WorkloadKind::CronJob,
                    WorkloadKind::Job,
                    WorkloadKind::Namespace,
                ];
                let id = SourceId::new(ns, kinds[idx], name);
                let parsed: SourceId = id.to_string().parse().unwrap();
                prop_assert_eq!(parsed, id);
            }
        }
    }
}

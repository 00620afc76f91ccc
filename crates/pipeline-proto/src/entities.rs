//! Entity records and their typed payloads.
//!
//! Free-form configuration coming from the server is represented as tagged
//! unions keyed by the entity's `type` field and checked with
//! [`Entity::validate`] before it reaches the store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::types::{Condition, EntityKey, EntityKind, Health, Language, Signal, SourceId};

/// Instrumentation state of a source workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentationStatus {
    /// Agents are injected and running.
    Instrumented,
    /// Instrumentation was requested but has not rolled out yet.
    #[default]
    Pending,
    /// The workload is not instrumented.
    Uninstrumented,
}

/// A container inside a source workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Detected language.
    pub language: Language,
    /// Detected runtime version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    /// Whether an agent is injected into this container.
    #[serde(default)]
    pub instrumented: bool,
    /// Another vendor's agent found in the container, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other_agent: Option<String>,
}

/// An instrumented workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Workload identity.
    pub id: SourceId,
    /// Instrumentation state.
    #[serde(default)]
    pub instrumentation: InstrumentationStatus,
    /// Service name reported to destinations, when overridden.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_name: Option<String>,
    /// Containers and their languages.
    #[serde(default)]
    pub containers: Vec<Container>,
    /// Ordered health conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Data streams this source belongs to.
    #[serde(default)]
    pub data_streams: Vec<String>,
}

impl Source {
    /// Create a pending source with no containers.
    #[must_use]
    pub const fn new(id: SourceId) -> Self {
        Self {
            id,
            instrumentation: InstrumentationStatus::Pending,
            reported_name: None,
            containers: Vec::new(),
            conditions: Vec::new(),
            data_streams: Vec::new(),
        }
    }

    /// Languages detected across all containers.
    #[must_use]
    pub fn languages(&self) -> BTreeSet<Language> {
        self.containers.iter().map(|c| c.language).collect()
    }
}

/// A telemetry export target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Destination id.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Vendor type (e.g. "jaeger", "datadog").
    pub destination_type: String,
    /// Signals exported to this destination.
    #[serde(default)]
    pub exported_signals: BTreeSet<Signal>,
    /// Typed configuration fields, ordered by name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Ordered health conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Data streams this destination belongs to.
    #[serde(default)]
    pub data_streams: Vec<String>,
}

/// A cluster attribute inserted by the `AddClusterInfo` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAttribute {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: String,
}

/// Per-endpoint latency threshold for the latency sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointFilter {
    /// Service name.
    pub service_name: String,
    /// HTTP route.
    pub http_route: String,
    /// Minimum latency to keep, in milliseconds.
    pub minimum_latency_threshold: u64,
    /// Fallback sampling ratio (0-100) for faster spans.
    pub fallback_sampling_ratio: f64,
}

/// Typed action payload keyed by action type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum ActionSpec {
    /// Add static cluster attributes to every signal.
    AddClusterInfo {
        /// Attributes to add.
        cluster_attributes: Vec<ClusterAttribute>,
    },
    /// Remove attributes by name.
    DeleteAttribute {
        /// Attribute names to delete.
        attribute_names: Vec<String>,
    },
    /// Rename attributes, ordered by source name.
    RenameAttribute {
        /// Old name to new name.
        renames: BTreeMap<String, String>,
    },
    /// Mask personally identifiable data.
    PiiMasking {
        /// Categories to mask (e.g. "CREDIT_CARD").
        pii_categories: Vec<String>,
    },
    /// Attach Kubernetes metadata.
    K8sAttributes {
        /// Collect container attributes.
        #[serde(default)]
        collect_container_attributes: bool,
        /// Collect workload uid.
        #[serde(default)]
        collect_workload_uid: bool,
        /// Pod labels copied to attributes.
        #[serde(default)]
        label_keys: Vec<String>,
    },
    /// Keep all error traces, sample the rest.
    ErrorSampler {
        /// Ratio (0-100) of non-error traces to keep.
        fallback_sampling_ratio: f64,
    },
    /// Keep slow traces per endpoint.
    LatencySampler {
        /// Endpoint thresholds.
        endpoints_filters: Vec<EndpointFilter>,
    },
    /// Keep a fixed percentage of traces.
    ProbabilisticSampler {
        /// Percentage (0-100) of traces to keep.
        sampling_percentage: f64,
    },
}

impl ActionSpec {
    /// The action type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::AddClusterInfo { .. } => "AddClusterInfo",
            Self::DeleteAttribute { .. } => "DeleteAttribute",
            Self::RenameAttribute { .. } => "RenameAttribute",
            Self::PiiMasking { .. } => "PiiMasking",
            Self::K8sAttributes { .. } => "K8sAttributes",
            Self::ErrorSampler { .. } => "ErrorSampler",
            Self::LatencySampler { .. } => "LatencySampler",
            Self::ProbabilisticSampler { .. } => "ProbabilisticSampler",
        }
    }

    fn validate(&self) -> Result<(), ProtoError> {
        let ratio = |name: &str, value: f64| {
            if (0.0..=100.0).contains(&value) {
                Ok(())
            } else {
                Err(ProtoError::Validation(format!(
                    "{name} must be within 0..=100, got {value}"
                )))
            }
        };

        match self {
            Self::AddClusterInfo { cluster_attributes } => {
                if cluster_attributes.iter().any(|a| a.name.is_empty()) {
                    return Err(ProtoError::Validation(
                        "cluster attribute with empty name".to_string(),
                    ));
                }
                non_empty("cluster_attributes", cluster_attributes)
            }
            Self::DeleteAttribute { attribute_names } => {
                non_empty("attribute_names", attribute_names)
            }
            Self::RenameAttribute { renames } => {
                if renames.iter().any(|(from, to)| from.is_empty() || to.is_empty()) {
                    return Err(ProtoError::Validation(
                        "rename with empty attribute name".to_string(),
                    ));
                }
                if renames.is_empty() {
                    return Err(ProtoError::Validation("renames is empty".to_string()));
                }
                Ok(())
            }
            Self::PiiMasking { pii_categories } => non_empty("pii_categories", pii_categories),
            Self::K8sAttributes { .. } => Ok(()),
            Self::ErrorSampler {
                fallback_sampling_ratio,
            } => ratio("fallback_sampling_ratio", *fallback_sampling_ratio),
            Self::LatencySampler { endpoints_filters } => {
                non_empty("endpoints_filters", endpoints_filters)?;
                endpoints_filters
                    .iter()
                    .try_for_each(|f| ratio("fallback_sampling_ratio", f.fallback_sampling_ratio))
            }
            Self::ProbabilisticSampler {
                sampling_percentage,
            } => ratio("sampling_percentage", *sampling_percentage),
        }
    }
}

/// A pipeline transform applied by the gateway tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action id.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Typed payload.
    #[serde(flatten)]
    pub spec: ActionSpec,
    /// Signals the action applies to.
    #[serde(default)]
    pub signals: BTreeSet<Signal>,
    /// Whether the action is switched off.
    #[serde(default)]
    pub disabled: bool,
    /// Ordered health conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Limits applied when collecting one kind of payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadLimits {
    /// Maximum payload bytes recorded.
    pub max_payload_length: u32,
    /// Drop payloads that exceed the limit instead of truncating them.
    #[serde(default)]
    pub drop_partial_payloads: bool,
}

/// Typed rule payload keyed by rule type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum RuleSpec {
    /// Record request/response payloads.
    PayloadCollection {
        /// HTTP request bodies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        http_request: Option<PayloadLimits>,
        /// HTTP response bodies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        http_response: Option<PayloadLimits>,
        /// Database query text.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db_query: Option<PayloadLimits>,
        /// Messaging payloads.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        messaging: Option<PayloadLimits>,
    },
    /// Record code location attributes.
    CodeAttributes {
        /// Record the function name.
        #[serde(default)]
        function: bool,
        /// Record the file path.
        #[serde(default)]
        file_path: bool,
        /// Record the line number.
        #[serde(default)]
        line_number: bool,
    },
    /// Record selected HTTP headers.
    HeadersCollection {
        /// Header names.
        header_keys: Vec<String>,
    },
    /// Add custom probes.
    CustomInstrumentation {
        /// Fully qualified function names to probe.
        probes: Vec<String>,
    },
}

impl RuleSpec {
    /// The rule type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::PayloadCollection { .. } => "PayloadCollection",
            Self::CodeAttributes { .. } => "CodeAttributes",
            Self::HeadersCollection { .. } => "HeadersCollection",
            Self::CustomInstrumentation { .. } => "CustomInstrumentation",
        }
    }

    fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::PayloadCollection {
                http_request,
                http_response,
                db_query,
                messaging,
            } => {
                let limits = [http_request, http_response, db_query, messaging];
                if limits.iter().all(|l| l.is_none()) {
                    return Err(ProtoError::Validation(
                        "payload collection selects no payload".to_string(),
                    ));
                }
                if limits.iter().flat_map(|l| l.iter()).any(|l| l.max_payload_length == 0) {
                    return Err(ProtoError::Validation(
                        "max_payload_length must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            Self::CodeAttributes { .. } => Ok(()),
            Self::HeadersCollection { header_keys } => non_empty("header_keys", header_keys),
            Self::CustomInstrumentation { probes } => non_empty("probes", probes),
        }
    }
}

/// Which sources a rule applies to. Absent filters match everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RuleScope {
    /// Specific workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workloads: Option<Vec<SourceId>>,
    /// Container languages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<Language>>,
}

impl RuleScope {
    /// Whether the scope selects `source`.
    #[must_use]
    pub fn matches(&self, source: &Source) -> bool {
        let workload_ok = self
            .workloads
            .as_ref()
            .is_none_or(|workloads| workloads.contains(&source.id));
        let language_ok = self.languages.as_ref().is_none_or(|languages| {
            source
                .containers
                .iter()
                .any(|c| languages.contains(&c.language))
        });
        workload_ok && language_ok
    }
}

/// A rule applied to a filtered subset of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationRule {
    /// Rule id.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Typed payload.
    #[serde(flatten)]
    pub spec: RuleSpec,
    /// Source filter.
    #[serde(default)]
    pub scope: RuleScope,
    /// Profile-managed rules cannot be edited or deleted by users.
    #[serde(default = "default_true")]
    pub mutable: bool,
    /// Whether the rule is switched off.
    #[serde(default)]
    pub disabled: bool,
    /// Ordered health conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

const fn default_true() -> bool {
    true
}

/// Role of a collector pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorRole {
    /// Per-node agent (daemonset).
    NodeCollector,
    /// Cluster gateway replica.
    Gateway,
}

/// A collector pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorAgent {
    /// Pod name.
    pub pod_name: String,
    /// Role in the pipeline.
    pub role: CollectorRole,
    /// Node the pod runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    /// Pod readiness.
    pub ready: bool,
    /// Container restart count.
    #[serde(default)]
    pub restarts: u32,
    /// Throughput in bytes per second.
    #[serde(default)]
    pub throughput_bytes: u64,
    /// Last time metrics were scraped from the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scrape: Option<DateTime<Utc>>,
    /// Ordered health conditions.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl CollectorAgent {
    /// Pod health: unhealthy when not ready or a condition failed.
    #[must_use]
    pub fn health(&self) -> Health {
        if self.ready {
            Health::from_conditions(&self.conditions)
        } else {
            Health::Unhealthy
        }
    }
}

/// A logical grouping used to partition the topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataStream {
    /// Stream name.
    pub name: String,
    /// Member sources.
    #[serde(default)]
    pub sources: Vec<SourceId>,
    /// Member destination ids.
    #[serde(default)]
    pub destinations: Vec<String>,
}

/// Any entity record, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Entity {
    /// A source workload.
    Source(Source),
    /// A destination.
    Destination(Destination),
    /// An action.
    Action(Action),
    /// An instrumentation rule.
    InstrumentationRule(InstrumentationRule),
    /// A collector pod.
    CollectorAgent(CollectorAgent),
    /// A data stream.
    DataStream(DataStream),
}

impl Entity {
    /// Decode a raw payload for the given kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not deserialize into the kind's record.
    pub fn from_payload(kind: EntityKind, payload: Value) -> Result<Self, ProtoError> {
        let entity = match kind {
            EntityKind::Source => Self::Source(serde_json::from_value(payload)?),
            EntityKind::Destination => Self::Destination(serde_json::from_value(payload)?),
            EntityKind::Action => Self::Action(serde_json::from_value(payload)?),
            EntityKind::InstrumentationRule => {
                Self::InstrumentationRule(serde_json::from_value(payload)?)
            }
            EntityKind::CollectorAgent => Self::CollectorAgent(serde_json::from_value(payload)?),
            EntityKind::DataStream => Self::DataStream(serde_json::from_value(payload)?),
        };
        Ok(entity)
    }

    /// The entity's kind.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Source(_) => EntityKind::Source,
            Self::Destination(_) => EntityKind::Destination,
            Self::Action(_) => EntityKind::Action,
            Self::InstrumentationRule(_) => EntityKind::InstrumentationRule,
            Self::CollectorAgent(_) => EntityKind::CollectorAgent,
            Self::DataStream(_) => EntityKind::DataStream,
        }
    }

    /// The entity's key.
    #[must_use]
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Source(s) => EntityKey::Source(s.id.clone()),
            Self::Destination(d) => EntityKey::name(&d.id),
            Self::Action(a) => EntityKey::name(&a.id),
            Self::InstrumentationRule(r) => EntityKey::name(&r.id),
            Self::CollectorAgent(c) => EntityKey::name(&c.pod_name),
            Self::DataStream(s) => EntityKey::name(&s.name),
        }
    }

    /// Ordered health conditions (empty for data streams).
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        match self {
            Self::Source(s) => &s.conditions,
            Self::Destination(d) => &d.conditions,
            Self::Action(a) => &a.conditions,
            Self::InstrumentationRule(r) => &r.conditions,
            Self::CollectorAgent(c) => &c.conditions,
            Self::DataStream(_) => &[],
        }
    }

    /// Derived health.
    #[must_use]
    pub fn health(&self) -> Health {
        match self {
            Self::CollectorAgent(c) => c.health(),
            other => Health::from_conditions(other.conditions()),
        }
    }

    /// Data streams the entity declares membership of.
    #[must_use]
    pub fn data_streams(&self) -> &[String] {
        match self {
            Self::Source(s) => &s.data_streams,
            Self::Destination(d) => &d.data_streams,
            _ => &[],
        }
    }

    /// Check the payload before it is trusted by the store.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<(), ProtoError> {
        match self {
            Self::Source(s) => s.id.validate(),
            Self::Destination(d) => {
                non_blank("destination id", &d.id)?;
                non_blank("destination_type", &d.destination_type)
            }
            Self::Action(a) => {
                non_blank("action id", &a.id)?;
                a.spec.validate()
            }
            Self::InstrumentationRule(r) => {
                non_blank("rule id", &r.id)?;
                if let Some(workloads) = &r.scope.workloads {
                    workloads.iter().try_for_each(SourceId::validate)?;
                }
                r.spec.validate()
            }
            Self::CollectorAgent(c) => non_blank("pod_name", &c.pod_name),
            Self::DataStream(s) => {
                non_blank("data stream name", &s.name)?;
                s.sources.iter().try_for_each(SourceId::validate)
            }
        }
    }
}

fn non_blank(field: &str, value: &str) -> Result<(), ProtoError> {
    if value.trim().is_empty() {
        Err(ProtoError::Validation(format!("{field} is empty")))
    } else {
        Ok(())
    }
}

fn non_empty<T>(field: &str, values: &[T]) -> Result<(), ProtoError> {
    if values.is_empty() {
        Err(ProtoError::Validation(format!("{field} is empty")))
    } else {
        Ok(())
    }
}

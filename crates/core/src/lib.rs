//! scopelink core types: resource records, identities, facts and the report tree.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod report;

pub use report::{
    LatestSample, MetadataTemplate, MetricData, MetricSample, MetricTemplate, Node, PartitionKey,
    PluginSpec, Report, TableColumn, TableTemplate, Template, Topology, DEFAULT_METRIC_CAPACITY,
};

/// Closed set of resource kinds the source can list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    DaemonSet,
    Deployment,
    StatefulSet,
    Service,
    Pod,
}

impl ResourceKind {
    /// Tag appended to the uid to form an [`Identity`].
    pub fn tag(&self) -> &'static str {
        match self {
            ResourceKind::DaemonSet => "<daemonset>",
            ResourceKind::Deployment => "<deployment>",
            ResourceKind::StatefulSet => "<statefulset>",
            ResourceKind::Service => "<service>",
            ResourceKind::Pod => "<pod>",
        }
    }

    pub fn partition(&self) -> PartitionKey {
        match self {
            ResourceKind::DaemonSet => PartitionKey::DaemonSet,
            ResourceKind::Deployment => PartitionKey::Deployment,
            ResourceKind::StatefulSet => PartitionKey::StatefulSet,
            ResourceKind::Service => PartitionKey::Service,
            ResourceKind::Pod => PartitionKey::Pods,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::Service => "Service",
            ResourceKind::Pod => "Pod",
        };
        f.write_str(s)
    }
}

/// One listed object, reduced to what fact extraction needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub kind: ResourceKind,
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// Kubernetes labels as key/value pairs.
    pub labels: SmallVec<[(String, String); 8]>,
    /// Kubernetes annotations as key/value pairs.
    pub annotations: SmallVec<[(String, String); 4]>,
    /// Ready replica count from the workload status, when the kind has one.
    pub ready_replicas: Option<i32>,
}

impl ResourceRecord {
    pub fn new(kind: ResourceKind, uid: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
            namespace: namespace.into(),
            name: name.into(),
            labels: SmallVec::new(),
            annotations: SmallVec::new(),
            ready_replicas: None,
        }
    }

    pub fn with_ready_replicas(mut self, n: i32) -> Self {
        self.ready_replicas = Some(n);
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Merge key of one resource inside a partition: `<uid>;<kind-tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(String);

impl Identity {
    pub fn new(uid: &str, kind: ResourceKind) -> Self { Identity(format!("{};{}", uid, kind.tag())) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Everything one record contributes to its partition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Facts {
    pub latest: Vec<(String, String)>,
    pub metrics: Vec<(String, MetricSample)>,
    pub templates: Vec<Template>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unsupported kind: {0}")]
    UnsupportedKind(ResourceKind),
    #[error("record {namespace}/{name} has no uid")]
    MissingUid { namespace: String, name: String },
}

/// Derives identity, partition and facts from a single record.
///
/// Implementations must be pure in the record, the capture time and their own
/// static configuration.
pub trait FactExtractor: Send + Sync {
    fn identify(&self, record: &ResourceRecord) -> Result<Identity, ExtractError>;

    fn partition_for(&self, record: &ResourceRecord) -> PartitionKey { record.kind.partition() }

    fn extract_facts(&self, record: &ResourceRecord, captured_at: DateTime<Utc>) -> Result<Facts, ExtractError>;
}

//! scopelink kubehub: the resource source the aggregator lists from.
//!
//! [`KubeSource`] talks to the cluster through kube-rs; [`StaticSource`] serves
//! fixed records from memory for tests and dry runs.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ListParams},
    Client, Resource,
};
use metrics::{counter, histogram};
use scopelink_core::{ResourceKind, ResourceRecord};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

/// One list call against the source. Each query yields records of a single kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Query {
    DaemonSets,
    Deployments,
    StatefulSets,
    Services,
    /// Lists every Pod in the cluster. No dashboard page exists for pods, so the
    /// link extractor skips all of them; opt-in only.
    Pods,
}

impl Query {
    /// Queries run every round unless configured otherwise.
    pub const DEFAULT: [Query; 4] = [Query::DaemonSets, Query::Deployments, Query::StatefulSets, Query::Services];

    pub fn kind(&self) -> ResourceKind {
        match self {
            Query::DaemonSets => ResourceKind::DaemonSet,
            Query::Deployments => ResourceKind::Deployment,
            Query::StatefulSets => ResourceKind::StatefulSet,
            Query::Services => ResourceKind::Service,
            Query::Pods => ResourceKind::Pod,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Query::DaemonSets => "daemonsets",
            Query::Deployments => "deployments",
            Query::StatefulSets => "statefulsets",
            Query::Services => "services",
            Query::Pods => "pods",
        }
    }

    pub fn parse(s: &str) -> Option<Query> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daemonsets" | "daemonset" | "ds" => Some(Query::DaemonSets),
            "deployments" | "deployment" | "deploy" => Some(Query::Deployments),
            "statefulsets" | "statefulset" | "sts" => Some(Query::StatefulSets),
            "services" | "service" | "svc" => Some(Query::Services),
            "pods" | "pod" | "po" => Some(Query::Pods),
            _ => None,
        }
    }
}

/// Where records come from. An `Err` from `list` counts as zero records for that query.
#[async_trait::async_trait]
pub trait ResourceSource: Send + Sync {
    /// Cheap reachability check run before each round.
    async fn probe(&self) -> Result<()>;

    async fn list(&self, query: Query) -> Result<Vec<ResourceRecord>>;
}

// ----------------- kube-rs backed source -----------------

pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    /// Build a client from in-cluster config or the local kubeconfig.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client (in-cluster or kubeconfig)")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self { Self { client } }
}

async fn list_all<K>(client: &Client) -> Result<Vec<K>>
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::all(client.clone());
    let list = api.list(&ListParams::default()).await?;
    Ok(list.items)
}

/// Reduce a typed kube object to a [`ResourceRecord`].
pub fn record_from<K: Resource>(kind: ResourceKind, obj: &K, ready_replicas: Option<i32>) -> ResourceRecord {
    let meta = obj.meta();
    let mut rec = ResourceRecord::new(
        kind,
        meta.uid.clone().unwrap_or_default(),
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    );
    if let Some(labels) = meta.labels.as_ref() {
        rec.labels = labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    if let Some(annos) = meta.annotations.as_ref() {
        rec.annotations = annos.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    }
    rec.ready_replicas = ready_replicas;
    rec
}

#[async_trait::async_trait]
impl ResourceSource for KubeSource {
    async fn probe(&self) -> Result<()> {
        let v = self.client.apiserver_version().await.context("contacting apiserver")?;
        debug!(major = %v.major, minor = %v.minor, "apiserver reachable");
        Ok(())
    }

    async fn list(&self, query: Query) -> Result<Vec<ResourceRecord>> {
        let started = Instant::now();
        let kind = query.kind();
        let out: Vec<ResourceRecord> = match query {
            Query::DaemonSets => list_all::<DaemonSet>(&self.client)
                .await?
                .iter()
                .map(|o| record_from(kind, o, o.status.as_ref().map(|s| s.number_ready)))
                .collect(),
            Query::Deployments => list_all::<Deployment>(&self.client)
                .await?
                .iter()
                .map(|o| record_from(kind, o, o.status.as_ref().and_then(|s| s.ready_replicas)))
                .collect(),
            Query::StatefulSets => list_all::<StatefulSet>(&self.client)
                .await?
                .iter()
                .map(|o| record_from(kind, o, o.status.as_ref().and_then(|s| s.ready_replicas)))
                .collect(),
            Query::Services => list_all::<Service>(&self.client)
                .await?
                .iter()
                .map(|o| record_from(kind, o, None))
                .collect(),
            Query::Pods => list_all::<Pod>(&self.client)
                .await?
                .iter()
                .map(|o| record_from(kind, o, None))
                .collect(),
        };
        histogram!("scopelink_list_ms", started.elapsed().as_secs_f64() * 1000.0, "query" => query.name());
        counter!("scopelink_listed_total", out.len() as u64, "query" => query.name());
        info!(query = query.name(), count = out.len(), took_ms = %started.elapsed().as_millis(), "list ok");
        Ok(out)
    }
}

// ----------------- in-memory source -----------------

/// Serves fixed records per query. Queries can be made to fail and the whole
/// source can be flipped unreachable, which is what round tests need.
#[derive(Default)]
pub struct StaticSource {
    records: Mutex<HashMap<Query, Vec<ResourceRecord>>>,
    failing: Mutex<Vec<Query>>,
    unreachable: AtomicBool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new() -> Self { Self::default() }

    /// Sleep this long inside every `list` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_records(self, query: Query, records: Vec<ResourceRecord>) -> Self {
        self.set_records(query, records);
        self
    }

    pub fn set_records(&self, query: Query, records: Vec<ResourceRecord>) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).insert(query, records);
    }

    pub fn fail_query(&self, query: Query) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).push(query);
    }

    pub fn set_reachable(&self, on: bool) { self.unreachable.store(!on, Ordering::SeqCst); }

    /// Number of `list` calls served so far.
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait::async_trait]
impl ResourceSource for StaticSource {
    async fn probe(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("static source marked unreachable"));
        }
        Ok(())
    }

    async fn list(&self, query: Query) -> Result<Vec<ResourceRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&query) {
            return Err(anyhow!("list {} failed", query.name()));
        }
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(&query).cloned().unwrap_or_default())
    }
}

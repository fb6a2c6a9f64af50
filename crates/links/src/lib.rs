//! scopelink links: turns workload records into dashboard link facts.
//!
//! Every supported record contributes a `link` metadata row pointing at its page
//! in the dashboard. Workloads that report readiness also contribute a
//! ready-replica metric sample, and per-object link tables can be switched on.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use scopelink_core::{
    ExtractError, FactExtractor, Facts, Identity, MetadataTemplate, MetricSample, MetricTemplate, ResourceKind,
    ResourceRecord, TableColumn, TableTemplate, Template,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DASHBOARD_URL: &str = "/console";
pub const DEFAULT_PREFIX: &str = "icp-link-";

/// Static settings threaded into the extractor at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Dashboard root that link paths are appended to.
    pub dashboard_url: String,
    /// Prefix for slot and template ids.
    pub prefix: String,
    /// Also emit a per-object multicolumn link table.
    pub link_tables: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { dashboard_url: DEFAULT_DASHBOARD_URL.to_string(), prefix: DEFAULT_PREFIX.to_string(), link_tables: false }
    }
}

impl LinkConfig {
    /// Read `SCOPELINK_DASHBOARD`, `SCOPELINK_LINK_PREFIX` and `SCOPELINK_LINK_TABLES`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let dashboard_url = std::env::var("SCOPELINK_DASHBOARD").ok().filter(|s| !s.is_empty()).unwrap_or(d.dashboard_url);
        let prefix = std::env::var("SCOPELINK_LINK_PREFIX").ok().filter(|s| !s.is_empty()).unwrap_or(d.prefix);
        let link_tables = std::env::var("SCOPELINK_LINK_TABLES")
            .ok()
            .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
            .unwrap_or(d.link_tables);
        Self { dashboard_url: dashboard_url.trim_end_matches('/').to_string(), prefix, link_tables }
    }
}

pub struct LinkExtractor {
    cfg: LinkConfig,
}

impl LinkExtractor {
    pub fn new(cfg: LinkConfig) -> Self { Self { cfg } }

    pub fn config(&self) -> &LinkConfig { &self.cfg }

    /// Dashboard page for a record, or `None` for kinds without one.
    pub fn link_for(&self, rec: &ResourceRecord) -> Option<String> {
        let path = match rec.kind {
            ResourceKind::DaemonSet => "workloads/daemonsets",
            ResourceKind::Deployment => "workloads/deployments",
            ResourceKind::StatefulSet => "workloads/statefulsets",
            ResourceKind::Service => "access/services",
            ResourceKind::Pod => return None,
        };
        Some(format!("{}/{}/{}/{}", self.cfg.dashboard_url, path, rec.namespace, rec.name))
    }

    pub fn meta_id(&self) -> String { format!("{}-meta", self.cfg.prefix) }

    pub fn ready_metric_id(&self) -> String { format!("{}ready-replicas", self.cfg.prefix) }

    fn meta_template(&self) -> MetadataTemplate {
        MetadataTemplate {
            id: self.meta_id(),
            label: "ICP Dashboard".to_string(),
            data_type: "link".to_string(),
            priority: 1.1,
            from: "latest".to_string(),
        }
    }

    fn ready_template(&self) -> MetricTemplate {
        MetricTemplate {
            id: self.ready_metric_id(),
            label: "Ready Replicas".to_string(),
            format: "integer".to_string(),
            priority: 2.0,
            min: None,
            max: None,
        }
    }
}

fn table_id(rec: &ResourceRecord) -> String { format!("table-{}", rec.name) }

fn link_table(rec: &ResourceRecord) -> (String, TableTemplate) {
    let id = table_id(rec);
    let column = format!("{}-column-1", id);
    let slot = format!("{}-1___{}", id, column);
    let tpl = TableTemplate {
        id: id.clone(),
        label: String::new(),
        prefix: format!("{}-", id),
        kind: "multicolumn-table".to_string(),
        columns: vec![TableColumn { id: column, label: "ICP Link".to_string(), data_type: String::new() }],
    };
    (slot, tpl)
}

impl FactExtractor for LinkExtractor {
    fn identify(&self, rec: &ResourceRecord) -> Result<Identity, ExtractError> {
        if rec.uid.is_empty() {
            return Err(ExtractError::MissingUid { namespace: rec.namespace.clone(), name: rec.name.clone() });
        }
        Ok(Identity::new(&rec.uid, rec.kind))
    }

    fn extract_facts(&self, rec: &ResourceRecord, captured_at: DateTime<Utc>) -> Result<Facts, ExtractError> {
        let url = self.link_for(rec).ok_or(ExtractError::UnsupportedKind(rec.kind))?;
        let mut facts = Facts::default();

        facts.templates.push(Template::Metadata(self.meta_template()));
        facts.latest.push((self.meta_id(), url.clone()));

        if let Some(ready) = rec.ready_replicas {
            facts.templates.push(Template::Metric(self.ready_template()));
            facts.metrics.push((self.ready_metric_id(), MetricSample { value: ready as f64, date: captured_at }));
        }

        if self.cfg.link_tables {
            let (slot, tpl) = link_table(rec);
            facts.templates.push(Template::Table(tpl));
            facts.latest.push((slot, url));
        }
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scopelink_core::PartitionKey;

    fn at() -> DateTime<Utc> { Utc.timestamp_opt(1_600_000_000, 0).unwrap() }

    fn rec(kind: ResourceKind, uid: &str, ns: &str, name: &str) -> ResourceRecord { ResourceRecord::new(kind, uid, ns, name) }

    #[test]
    fn links_follow_kind_paths() {
        let x = LinkExtractor::new(LinkConfig::default());
        assert_eq!(x.link_for(&rec(ResourceKind::Deployment, "a", "ns1", "web")).unwrap(), "/console/workloads/deployments/ns1/web");
        assert_eq!(x.link_for(&rec(ResourceKind::DaemonSet, "a", "kube-system", "agent")).unwrap(), "/console/workloads/daemonsets/kube-system/agent");
        assert_eq!(x.link_for(&rec(ResourceKind::StatefulSet, "a", "db", "pg")).unwrap(), "/console/workloads/statefulsets/db/pg");
        assert_eq!(x.link_for(&rec(ResourceKind::Service, "a", "ns1", "api")).unwrap(), "/console/access/services/ns1/api");
        assert!(x.link_for(&rec(ResourceKind::Pod, "a", "ns1", "web-1")).is_none());
    }

    #[test]
    fn base_url_is_configurable() {
        let cfg = LinkConfig { dashboard_url: "https://icp.example:8443/console".into(), ..Default::default() };
        let x = LinkExtractor::new(cfg);
        assert_eq!(
            x.link_for(&rec(ResourceKind::Service, "a", "default", "kubernetes")).unwrap(),
            "https://icp.example:8443/console/access/services/default/kubernetes"
        );
    }

    #[test]
    fn identity_and_partition() {
        let x = LinkExtractor::new(LinkConfig::default());
        let r = rec(ResourceKind::Deployment, "abc", "ns1", "web");
        assert_eq!(x.identify(&r).unwrap().as_str(), "abc;<deployment>");
        assert_eq!(x.partition_for(&r), PartitionKey::Deployment);
        let missing = rec(ResourceKind::Service, "", "ns1", "api");
        assert!(matches!(x.identify(&missing), Err(ExtractError::MissingUid { .. })));
    }

    #[test]
    fn link_facts_for_deployment() {
        let x = LinkExtractor::new(LinkConfig::default());
        let facts = x.extract_facts(&rec(ResourceKind::Deployment, "abc", "ns1", "web"), at()).unwrap();
        assert_eq!(facts.latest, vec![("icp-link--meta".to_string(), "/console/workloads/deployments/ns1/web".to_string())]);
        assert!(facts.metrics.is_empty());
        assert_eq!(facts.templates.len(), 1);
        match &facts.templates[0] {
            Template::Metadata(m) => {
                assert_eq!(m.id, "icp-link--meta");
                assert_eq!(m.data_type, "link");
                assert_eq!(m.from, "latest");
            }
            other => panic!("unexpected template {:?}", other),
        }
    }

    #[test]
    fn ready_replicas_become_a_metric() {
        let x = LinkExtractor::new(LinkConfig::default());
        let r = rec(ResourceKind::StatefulSet, "s1", "db", "pg").with_ready_replicas(2);
        let facts = x.extract_facts(&r, at()).unwrap();
        assert_eq!(facts.metrics.len(), 1);
        let (slot, sample) = &facts.metrics[0];
        assert_eq!(slot, "icp-link-ready-replicas");
        assert_eq!(sample.value, 2.0);
        assert_eq!(sample.date, at());
        assert!(facts.templates.iter().any(|t| matches!(t, Template::Metric(m) if m.id == "icp-link-ready-replicas")));
    }

    #[test]
    fn ready_template_omits_zero_bounds() {
        let x = LinkExtractor::new(LinkConfig::default());
        let r = rec(ResourceKind::Deployment, "abc", "ns1", "web").with_ready_replicas(3);
        let facts = x.extract_facts(&r, at()).unwrap();
        let tpl = facts
            .templates
            .iter()
            .find_map(|t| if let Template::Metric(m) = t { Some(m) } else { None })
            .unwrap();
        let json = serde_json::to_value(tpl).unwrap();
        assert!(json.get("min").is_none());
        assert!(json.get("max").is_none());
        assert_eq!(json["format"], "integer");
    }

    #[test]
    fn link_tables_add_table_and_slot() {
        let x = LinkExtractor::new(LinkConfig { link_tables: true, ..Default::default() });
        let facts = x.extract_facts(&rec(ResourceKind::DaemonSet, "d1", "ns", "agent"), at()).unwrap();
        assert!(facts.latest.iter().any(|(k, _)| k == "table-agent-1___table-agent-column-1"));
        let table = facts
            .templates
            .iter()
            .find_map(|t| if let Template::Table(t) = t { Some(t) } else { None })
            .unwrap();
        assert_eq!(table.id, "table-agent");
        assert_eq!(table.prefix, "table-agent-");
        assert_eq!(table.kind, "multicolumn-table");
        assert_eq!(table.columns[0].id, "table-agent-column-1");
    }

    #[test]
    fn pods_are_unsupported() {
        let x = LinkExtractor::new(LinkConfig::default());
        let err = x.extract_facts(&rec(ResourceKind::Pod, "p1", "ns", "web-1"), at()).unwrap_err();
        assert_eq!(err, ExtractError::UnsupportedKind(ResourceKind::Pod));
    }

    #[test]
    fn extraction_is_pure() {
        let x = LinkExtractor::new(LinkConfig { link_tables: true, ..Default::default() });
        let r = rec(ResourceKind::Deployment, "abc", "ns1", "web").with_ready_replicas(1);
        assert_eq!(x.extract_facts(&r, at()).unwrap(), x.extract_facts(&r, at()).unwrap());
    }
}

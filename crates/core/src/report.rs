//! Report tree: partitions, nodes, bounded metric series and rendering templates.
//!
//! Field names and omission rules follow the Scope plugin report format, so the
//! serialized form can be handed to the host as-is.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Default number of samples kept per metric slot.
pub const DEFAULT_METRIC_CAPACITY: usize = 50;

fn default_capacity() -> usize { DEFAULT_METRIC_CAPACITY }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestSample {
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub value: f64,
    pub date: DateTime<Utc>,
}

/// Append-only sample series with running extremes.
///
/// `min`/`max` track every sample ever appended, including ones already compacted
/// away, so a stale extreme can outlive its sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricData {
    pub samples: Vec<MetricSample>,
    pub min: f64,
    pub max: f64,
}

impl MetricData {
    pub fn len(&self) -> usize { self.samples.len() }
    pub fn is_empty(&self) -> bool { self.samples.is_empty() }

    /// Append a sample; once the series holds more than `cap` samples only the
    /// tail starting at `cap / 2` survives. At least one sample is dropped per
    /// overflow, so the series stays within `cap` for any `cap >= 1`.
    pub fn push(&mut self, sample: MetricSample, cap: usize) {
        if self.samples.is_empty() {
            self.min = sample.value;
            self.max = sample.value;
        } else {
            self.min = self.min.min(sample.value);
            self.max = self.max.max(sample.value);
        }
        self.samples.push(sample);
        if self.samples.len() > cap {
            self.samples.drain(..(cap / 2).max(1));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Node {
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub latest: FxHashMap<String, LatestSample>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub metrics: FxHashMap<String, MetricData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricTemplate {
    pub id: String,
    pub label: String,
    pub format: String,
    pub priority: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataTemplate {
    pub id: String,
    pub label: String,
    #[serde(rename = "dataType")]
    pub data_type: String,
    pub priority: f32,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub id: String,
    pub label: String,
    #[serde(rename = "dataType")]
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableTemplate {
    pub id: String,
    pub label: String,
    pub prefix: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<TableColumn>,
}

/// Rendering template produced alongside facts.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    Metadata(MetadataTemplate),
    Table(TableTemplate),
    Metric(MetricTemplate),
}

/// One report partition: node states keyed by identity plus template catalogs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Topology {
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub nodes: FxHashMap<String, Node>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub metadata_templates: FxHashMap<String, MetadataTemplate>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub table_templates: FxHashMap<String, TableTemplate>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub metric_templates: FxHashMap<String, MetricTemplate>,
    #[serde(skip, default = "default_capacity")]
    metric_capacity: usize,
}

impl Default for Topology {
    fn default() -> Self { Self::with_capacity(DEFAULT_METRIC_CAPACITY) }
}

impl Topology {
    pub fn with_capacity(metric_capacity: usize) -> Self {
        Self {
            nodes: FxHashMap::default(),
            metadata_templates: FxHashMap::default(),
            table_templates: FxHashMap::default(),
            metric_templates: FxHashMap::default(),
            metric_capacity: metric_capacity.max(2),
        }
    }

    pub fn metric_capacity(&self) -> usize { self.metric_capacity }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.metadata_templates.is_empty()
            && self.table_templates.is_empty()
            && self.metric_templates.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Node> { self.nodes.get(id) }

    fn node_mut(&mut self, id: &str) -> &mut Node {
        self.nodes.entry(id.to_string()).or_default()
    }

    pub fn add_latest(&mut self, id: &str, slot: &str, value: String, timestamp: DateTime<Utc>) {
        self.node_mut(id).latest.insert(slot.to_string(), LatestSample { value, timestamp });
    }

    pub fn add_metric_sample(&mut self, id: &str, slot: &str, sample: MetricSample) {
        let cap = self.metric_capacity;
        self.node_mut(id).metrics.entry(slot.to_string()).or_default().push(sample, cap);
    }

    /// Replace a whole series, e.g. when seeding a fresh round with history.
    pub fn add_metric_data(&mut self, id: &str, slot: &str, data: MetricData) {
        self.node_mut(id).metrics.insert(slot.to_string(), data);
    }

    pub fn add_metadata_template(&mut self, tpl: MetadataTemplate) {
        self.metadata_templates.insert(tpl.id.clone(), tpl);
    }

    pub fn add_table_template(&mut self, tpl: TableTemplate) {
        self.table_templates.insert(tpl.id.clone(), tpl);
    }

    pub fn add_metric_template(&mut self, tpl: MetricTemplate) {
        self.metric_templates.insert(tpl.id.clone(), tpl);
    }

    pub fn add_template(&mut self, tpl: Template) {
        match tpl {
            Template::Metadata(t) => self.add_metadata_template(t),
            Template::Table(t) => self.add_table_template(t),
            Template::Metric(t) => self.add_metric_template(t),
        }
    }
}

/// Plugin self-description carried at the top of every report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub api_version: u32,
}

fn is_zero(v: &u32) -> bool { *v == 0 }

impl Default for PluginSpec {
    fn default() -> Self {
        Self {
            id: "icp-dashboard".to_string(),
            label: "ICP Dashboard".to_string(),
            description: "Links into the ICP Dashboard".to_string(),
            interfaces: vec!["reporter".to_string()],
            api_version: 1,
        }
    }
}

/// Named report partitions, one per category of resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionKey {
    DaemonSet,
    Deployment,
    Pods,
    Service,
    StatefulSet,
}

impl PartitionKey {
    pub const ALL: [PartitionKey; 5] = [
        PartitionKey::DaemonSet,
        PartitionKey::Deployment,
        PartitionKey::Pods,
        PartitionKey::Service,
        PartitionKey::StatefulSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKey::DaemonSet => "DaemonSet",
            PartitionKey::Deployment => "Deployment",
            PartitionKey::Pods => "Pods",
            PartitionKey::Service => "Service",
            PartitionKey::StatefulSet => "StatefulSet",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Report {
    #[serde(rename = "Plugins", default)]
    pub plugins: Vec<PluginSpec>,
    #[serde(rename = "DaemonSet", default, skip_serializing_if = "Topology::is_empty")]
    pub daemon_set: Topology,
    #[serde(rename = "Deployment", default, skip_serializing_if = "Topology::is_empty")]
    pub deployment: Topology,
    #[serde(rename = "Pods", default, skip_serializing_if = "Topology::is_empty")]
    pub pods: Topology,
    #[serde(rename = "Service", default, skip_serializing_if = "Topology::is_empty")]
    pub service: Topology,
    #[serde(rename = "StatefulSet", default, skip_serializing_if = "Topology::is_empty")]
    pub stateful_set: Topology,
}

impl Report {
    pub fn new(plugin: PluginSpec, metric_capacity: usize) -> Self {
        Self {
            plugins: vec![plugin],
            daemon_set: Topology::with_capacity(metric_capacity),
            deployment: Topology::with_capacity(metric_capacity),
            pods: Topology::with_capacity(metric_capacity),
            service: Topology::with_capacity(metric_capacity),
            stateful_set: Topology::with_capacity(metric_capacity),
        }
    }

    pub fn topology(&self, key: PartitionKey) -> &Topology {
        match key {
            PartitionKey::DaemonSet => &self.daemon_set,
            PartitionKey::Deployment => &self.deployment,
            PartitionKey::Pods => &self.pods,
            PartitionKey::Service => &self.service,
            PartitionKey::StatefulSet => &self.stateful_set,
        }
    }

    pub fn topology_mut(&mut self, key: PartitionKey) -> &mut Topology {
        match key {
            PartitionKey::DaemonSet => &mut self.daemon_set,
            PartitionKey::Deployment => &mut self.deployment,
            PartitionKey::Pods => &mut self.pods,
            PartitionKey::Service => &mut self.service,
            PartitionKey::StatefulSet => &mut self.stateful_set,
        }
    }

    /// Total node count across all partitions.
    pub fn node_count(&self) -> usize {
        PartitionKey::ALL.iter().map(|k| self.topology(*k).nodes.len()).sum()
    }

    /// Copy every metric series of `prev` into this report, keyed the same way.
    pub fn seed_metrics_from(&mut self, prev: &Report) {
        for key in PartitionKey::ALL {
            let src = prev.topology(key);
            let dst = self.topology_mut(key);
            for (id, node) in src.nodes.iter() {
                for (slot, data) in node.metrics.iter() {
                    dst.add_metric_data(id, slot, data.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn ts(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(1_600_000_000 + secs, 0).unwrap() }

    fn sample(v: f64, secs: i64) -> MetricSample { MetricSample { value: v, date: ts(secs) } }

    #[test]
    fn latest_last_write_wins() {
        let mut t = Topology::default();
        t.add_latest("a;<deployment>", "slot", "v1".into(), ts(1));
        t.add_latest("a;<deployment>", "slot", "v2".into(), ts(2));
        let got = &t.node("a;<deployment>").unwrap().latest["slot"];
        assert_eq!(got.value, "v2");
        assert_eq!(got.timestamp, ts(2));
        assert_eq!(t.nodes.len(), 1);
    }

    #[test]
    fn latest_rewrite_same_value_only_moves_timestamp() {
        let mut t = Topology::default();
        t.add_latest("a", "slot", "same".into(), ts(1));
        let before = t.clone();
        t.add_latest("a", "slot", "same".into(), ts(5));
        let mut expected = before;
        expected.nodes.get_mut("a").unwrap().latest.get_mut("slot").unwrap().timestamp = ts(5);
        assert_eq!(t, expected);
    }

    #[test]
    fn tiny_and_odd_capacities_stay_bounded() {
        for cap in [1usize, 2, 3] {
            let mut t = Topology::with_capacity(cap);
            for i in 1..=(2 * cap + 1) {
                t.add_metric_sample("n", "m", sample(i as f64, i as i64));
                let data = &t.node("n").unwrap().metrics["m"];
                assert!(data.len() <= t.metric_capacity(), "cap {} grew to {}", cap, data.len());
                assert!(data.samples.windows(2).all(|w| w[0].date < w[1].date));
            }
            let last = t.node("n").unwrap().metrics["m"].samples.last().unwrap().value;
            assert_eq!(last, (2 * cap + 1) as f64);
        }
    }

    #[test]
    fn series_bound_holds_when_pushing_directly() {
        let mut data = MetricData::default();
        for i in 1..=10 {
            data.push(sample(i as f64, i), 1);
            assert_eq!(data.len(), 1);
        }
        assert_eq!(data.samples[0].value, 10.0);
        assert_eq!((data.min, data.max), (1.0, 10.0));
    }

    #[test]
    fn capacity_is_clamped_to_two() {
        assert_eq!(Topology::with_capacity(0).metric_capacity(), 2);
        assert_eq!(Topology::with_capacity(1).metric_capacity(), 2);
        assert_eq!(Report::new(PluginSpec::default(), 1).deployment.metric_capacity(), 2);
    }

    #[test]
    fn overflow_keeps_tail_from_half_capacity() {
        let mut t = Topology::with_capacity(50);
        for i in 1..=50 {
            t.add_metric_sample("n", "m", sample(i as f64, i));
        }
        let prev = t.node("n").unwrap().metrics["m"].samples.clone();
        assert_eq!(prev.len(), 50);

        t.add_metric_sample("n", "m", sample(51.0, 51));
        let data = &t.node("n").unwrap().metrics["m"];
        assert_eq!(data.len(), 26);
        let mut expected: Vec<MetricSample> = prev[25..].to_vec();
        expected.push(sample(51.0, 51));
        assert_eq!(data.samples, expected);
        assert_eq!(data.samples.first().unwrap().value, 26.0);
    }

    #[test]
    fn sixty_samples_leave_thirty_five() {
        let mut d = MetricData::default();
        let start = ts(0);
        for i in 0..60 {
            d.push(MetricSample { value: i as f64, date: start + Duration::seconds(i) }, 50);
            assert!(d.len() <= 50);
        }
        assert_eq!(d.len(), 35);
        let dates: Vec<_> = d.samples.iter().map(|s| s.date).collect();
        let mut sorted = dates.clone();
        sorted.sort();
        assert_eq!(dates, sorted);
    }

    #[test]
    fn running_extremes_survive_compaction() {
        let mut d = MetricData::default();
        d.push(sample(-7.5, 0), 4);
        for i in 1..20 {
            d.push(sample(i as f64, i), 4);
        }
        assert!(d.len() <= 4);
        // -7.5 was compacted away long ago but still defines the minimum
        assert_eq!(d.min, -7.5);
        assert_eq!(d.max, 19.0);
    }

    #[test]
    fn first_sample_sets_both_extremes() {
        let mut d = MetricData::default();
        d.push(sample(3.0, 0), 50);
        assert_eq!((d.min, d.max), (3.0, 3.0));
        d.push(sample(5.0, 1), 50);
        assert_eq!((d.min, d.max), (3.0, 5.0));
    }

    #[test]
    fn templates_upsert_by_id() {
        let mut t = Topology::default();
        let tpl = MetadataTemplate { id: "x".into(), label: "X".into(), data_type: "link".into(), priority: 1.1, from: "latest".into() };
        t.add_metadata_template(tpl.clone());
        t.add_metadata_template(tpl.clone());
        assert_eq!(t.metadata_templates.len(), 1);
        t.add_template(Template::Metric(MetricTemplate { id: "m".into(), label: "M".into(), format: "integer".into(), priority: 2.0, min: None, max: None }));
        assert_eq!(t.metric_templates.len(), 1);
    }

    #[test]
    fn empty_partitions_are_omitted() {
        let mut r = Report::new(PluginSpec::default(), 50);
        r.deployment.add_latest("abc;<deployment>", "icp-link--meta", "/console/x".into(), ts(0));
        let v = serde_json::to_value(&r).unwrap();
        let obj = v.as_object().unwrap();
        assert!(obj.contains_key("Plugins"));
        assert!(obj.contains_key("Deployment"));
        assert!(!obj.contains_key("Service"));
        let dep = obj["Deployment"].as_object().unwrap();
        assert!(dep.contains_key("nodes"));
        assert!(!dep.contains_key("metadata_templates"));
        let node = &dep["nodes"]["abc;<deployment>"];
        assert!(node.get("metrics").is_none());
        assert_eq!(node["latest"]["icp-link--meta"]["value"], "/console/x");
        assert_eq!(v["Plugins"][0]["api_version"], 1);
    }

    #[test]
    fn seed_metrics_copies_series_only() {
        let mut prev = Report::new(PluginSpec::default(), 50);
        prev.stateful_set.add_metric_sample("s", "m", sample(1.0, 0));
        prev.stateful_set.add_latest("s", "l", "x".into(), ts(0));
        let mut next = Report::new(PluginSpec::default(), 50);
        next.seed_metrics_from(&prev);
        let node = next.stateful_set.node("s").unwrap();
        assert_eq!(node.metrics["m"].len(), 1);
        assert!(node.latest.is_empty());
    }
}

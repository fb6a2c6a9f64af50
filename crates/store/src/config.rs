use std::time::Duration;

use scopelink_core::{PluginSpec, DEFAULT_METRIC_CAPACITY};
use scopelink_kubehub::Query;
use serde::{Deserialize, Serialize};

pub const DEFAULT_INTERVAL_SECS: u64 = 10;

/// Round cadence and report shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    pub interval: Duration,
    /// Samples kept per metric slot before half-window compaction.
    pub metric_capacity: usize,
    /// Seed each fresh report with the metric series of the last published one.
    pub carry_metric_history: bool,
    pub queries: Vec<Query>,
    pub plugin: PluginSpec,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            metric_capacity: DEFAULT_METRIC_CAPACITY,
            carry_metric_history: false,
            queries: Query::DEFAULT.to_vec(),
            plugin: PluginSpec::default(),
        }
    }
}

impl AggregatorConfig {
    /// Defaults overridden by `SCOPELINK_INTERVAL_SECS`, `SCOPELINK_METRIC_CAPACITY`,
    /// `SCOPELINK_CARRY_HISTORY` and `SCOPELINK_QUERIES` (comma separated).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(secs) = std::env::var("SCOPELINK_INTERVAL_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(cap) = std::env::var("SCOPELINK_METRIC_CAPACITY").ok().and_then(|s| s.parse::<usize>().ok()) {
            cfg.metric_capacity = cap.max(2);
        }
        if let Ok(v) = std::env::var("SCOPELINK_CARRY_HISTORY") {
            cfg.carry_metric_history = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(list) = std::env::var("SCOPELINK_QUERIES") {
            let parsed = parse_queries(&list);
            if !parsed.is_empty() {
                cfg.queries = parsed;
            }
        }
        cfg
    }
}

/// Parse a comma separated query list, dropping unknown names and duplicates.
pub fn parse_queries(list: &str) -> Vec<Query> {
    let mut out: Vec<Query> = Vec::new();
    for q in list.split(',').filter_map(Query::parse) {
        if !out.contains(&q) {
            out.push(q);
        }
    }
    out
}

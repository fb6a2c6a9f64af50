//! scopelink store: collection rounds, the live report and the published snapshot.
//!
//! A round fans out one task per query, merges every extracted fact into a single
//! mutex-guarded live [`Report`], joins all tasks and then swaps the finished report
//! into an [`ArcSwap`]. Readers only ever load the published `Arc`.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use scopelink_core::{ExtractError, FactExtractor, Facts, Identity, PartitionKey, Report};
use scopelink_kubehub::{Query, ResourceSource};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

mod config;

pub use config::{parse_queries, AggregatorConfig, DEFAULT_INTERVAL_SECS};

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("resource source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("report serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The report being written by the round in flight.
pub struct LiveReport {
    inner: Mutex<Report>,
}

impl LiveReport {
    pub fn new(report: Report) -> Self { Self { inner: Mutex::new(report) } }

    /// Merge all facts of one record under a single lock hold.
    pub fn apply(&self, partition: PartitionKey, id: &Identity, facts: Facts, captured_at: DateTime<Utc>) {
        let mut report = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let topo = report.topology_mut(partition);
        for tpl in facts.templates {
            topo.add_template(tpl);
        }
        for (slot, value) in facts.latest {
            topo.add_latest(id.as_str(), &slot, value, captured_at);
        }
        for (slot, sample) in facts.metrics {
            topo.add_metric_sample(id.as_str(), &slot, sample);
        }
    }

    pub fn snapshot(&self) -> Report { self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone() }

    pub fn into_inner(self) -> Report { self.inner.into_inner().unwrap_or_else(|e| e.into_inner()) }
}

/// Read side of the aggregator: the last completed report and its epoch.
#[derive(Clone)]
pub struct ReportHandle {
    snap: Arc<ArcSwap<Report>>,
    epoch_rx: watch::Receiver<u64>,
}

impl ReportHandle {
    /// Latest published report. Never waits for a round in flight.
    pub fn current(&self) -> Arc<Report> { self.snap.load_full() }

    /// Number of rounds published so far.
    pub fn epoch(&self) -> u64 { *self.epoch_rx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Serialize the current report for the host. Failures leave the published report as is.
    pub fn render(&self) -> Result<Vec<u8>, AggregateError> {
        let report = self.current();
        Ok(serde_json::to_vec(&*report)?)
    }

    pub fn render_pretty(&self) -> Result<String, AggregateError> {
        let report = self.current();
        Ok(serde_json::to_string_pretty(&*report)?)
    }
}

/// Outcome of one query task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub records: usize,
    pub skipped: usize,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub epoch: u64,
    pub queries: usize,
    pub records: usize,
    pub skipped: usize,
    pub query_errors: usize,
    pub nodes: usize,
    pub took: Duration,
}

pub struct Aggregator {
    source: Arc<dyn ResourceSource>,
    extractor: Arc<dyn FactExtractor>,
    cfg: AggregatorConfig,
    published: Arc<ArcSwap<Report>>,
    epoch_tx: watch::Sender<u64>,
    epoch_rx: watch::Receiver<u64>,
    round_gate: tokio::sync::Mutex<()>,
}

impl Aggregator {
    pub fn new(source: Arc<dyn ResourceSource>, extractor: Arc<dyn FactExtractor>, cfg: AggregatorConfig) -> Self {
        let initial = Report::new(cfg.plugin.clone(), cfg.metric_capacity);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            source,
            extractor,
            cfg,
            published: Arc::new(ArcSwap::from_pointee(initial)),
            epoch_tx,
            epoch_rx,
            round_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AggregatorConfig { &self.cfg }

    pub fn handle(&self) -> ReportHandle {
        ReportHandle { snap: Arc::clone(&self.published), epoch_rx: self.epoch_rx.clone() }
    }

    /// Run one full collection round and publish its report.
    ///
    /// Rounds are serialized; a caller arriving while another round runs waits for it.
    /// If the source cannot be reached the round is abandoned and the published
    /// report stays as it was.
    pub async fn run_round(&self) -> Result<RoundStats, AggregateError> {
        let _gate = self.round_gate.lock().await;
        let t0 = Instant::now();

        if let Err(e) = self.source.probe().await {
            counter!("scopelink_round_failed_total", 1u64);
            return Err(AggregateError::SourceUnavailable(format!("{:#}", e)));
        }

        let mut fresh = Report::new(self.cfg.plugin.clone(), self.cfg.metric_capacity);
        if self.cfg.carry_metric_history {
            fresh.seed_metrics_from(&self.published.load());
        }
        let live = Arc::new(LiveReport::new(fresh));

        let mut set = JoinSet::new();
        for query in self.cfg.queries.iter().copied() {
            let source = Arc::clone(&self.source);
            let extractor = Arc::clone(&self.extractor);
            let live = Arc::clone(&live);
            set.spawn(collect_query(source, extractor, live, query));
        }

        let mut stats = RoundStats { queries: self.cfg.queries.len(), ..Default::default() };
        let mut joined = 0usize;
        while let Some(res) = set.join_next().await {
            joined += 1;
            match res {
                Ok(q) => {
                    stats.records += q.records;
                    stats.skipped += q.skipped;
                    if q.failed {
                        stats.query_errors += 1;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "query task did not complete");
                    stats.query_errors += 1;
                }
            }
        }
        debug!(joined, expected = stats.queries, "all query tasks joined");

        let report = match Arc::try_unwrap(live) {
            Ok(live) => live.into_inner(),
            Err(shared) => shared.snapshot(),
        };
        stats.nodes = report.node_count();
        self.published.store(Arc::new(report));
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
        stats.epoch = *self.epoch_tx.borrow();
        stats.took = t0.elapsed();

        counter!("scopelink_round_total", 1u64);
        histogram!("scopelink_round_ms", stats.took.as_secs_f64() * 1000.0);
        gauge!("scopelink_report_nodes", stats.nodes as f64);
        info!(
            epoch = stats.epoch,
            records = stats.records,
            skipped = stats.skipped,
            query_errors = stats.query_errors,
            nodes = stats.nodes,
            took_ms = %stats.took.as_millis(),
            "round published"
        );
        Ok(stats)
    }
}

async fn collect_query(
    source: Arc<dyn ResourceSource>,
    extractor: Arc<dyn FactExtractor>,
    live: Arc<LiveReport>,
    query: Query,
) -> QueryStats {
    let mut qs = QueryStats::default();
    let records = match source.list(query).await {
        Ok(r) => r,
        Err(e) => {
            warn!(query = query.name(), error = ?e, "list failed; no records this round");
            counter!("scopelink_query_errors_total", 1u64, "query" => query.name());
            qs.failed = true;
            return qs;
        }
    };
    for rec in records.iter() {
        let captured_at = Utc::now();
        let extracted = extractor
            .identify(rec)
            .and_then(|id| extractor.extract_facts(rec, captured_at).map(|facts| (id, facts)));
        match extracted {
            Ok((id, facts)) => {
                live.apply(extractor.partition_for(rec), &id, facts, captured_at);
                qs.records += 1;
            }
            Err(ExtractError::UnsupportedKind(kind)) => {
                debug!(query = query.name(), %kind, name = %rec.name, "skipping record of unsupported kind");
                qs.skipped += 1;
            }
            Err(e) => {
                warn!(query = query.name(), error = %e, "skipping record");
                qs.skipped += 1;
            }
        }
    }
    counter!("scopelink_records_total", qs.records as u64, "query" => query.name());
    counter!("scopelink_records_skipped_total", qs.skipped as u64, "query" => query.name());
    qs
}

/// Run rounds forever on the configured interval. A slow round delays the next
/// tick instead of overlapping it.
pub fn spawn_scheduler(agg: Arc<Aggregator>) -> (ReportHandle, JoinHandle<()>) {
    let handle = agg.handle();
    let interval = agg.config().interval;
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = %interval.as_millis(), queries = agg.config().queries.len(), "scheduler started");
        loop {
            ticker.tick().await;
            if let Err(e) = agg.run_round().await {
                warn!(error = %e, "round failed; keeping last published report");
            }
        }
    });
    (handle, task)
}

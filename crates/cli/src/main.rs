use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use scopelink_core::{PartitionKey, Report};
use scopelink_kubehub::{KubeSource, Query, ResourceSource};
use scopelink_links::{LinkConfig, LinkExtractor};
use scopelink_store::{parse_queries, spawn_scheduler, Aggregator, AggregatorConfig, ReportHandle};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "scopelinkctl", version, about = "Dashboard link reporter for Scope")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Json)]
    output: Output,

    /// Dashboard base URL that links are built on (default: /console)
    #[arg(long = "dashboard", global = true)]
    dashboard: Option<String>,

    /// Comma separated queries, e.g. "deploy,svc"
    #[arg(long = "queries", global = true)]
    queries: Option<String>,

    /// Samples kept per metric slot
    #[arg(long = "metric-capacity", global = true)]
    metric_capacity: Option<usize>,

    /// Emit per-object link tables as well
    #[arg(long = "link-tables", global = true, action = ArgAction::SetTrue)]
    link_tables: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single round and print the report
    Once,
    /// Run rounds on an interval until Ctrl-C
    Run {
        /// Seconds between rounds
        #[arg(long = "interval-secs")]
        interval_secs: Option<u64>,
        /// Keep metric series across rounds
        #[arg(long = "carry-history", action = ArgAction::SetTrue)]
        carry_history: bool,
        /// Write each published report to this file instead of stdout
        #[arg(long = "out")]
        out: Option<std::path::PathBuf>,
    },
    /// List known queries and where their records land
    Kinds,
}

fn init_tracing() {
    let env = std::env::var("SCOPELINK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SCOPELINK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid SCOPELINK_METRICS_ADDR; expected host:port");
        }
    }
}

fn link_config(cli: &Cli) -> LinkConfig {
    let mut cfg = LinkConfig::from_env();
    if let Some(url) = cli.dashboard.as_deref() {
        cfg.dashboard_url = url.trim_end_matches('/').to_string();
    }
    if cli.link_tables {
        cfg.link_tables = true;
    }
    cfg
}

fn aggregator_config(cli: &Cli) -> AggregatorConfig {
    let mut cfg = AggregatorConfig::from_env();
    if let Some(list) = cli.queries.as_deref() {
        let parsed = parse_queries(list);
        if parsed.is_empty() {
            warn!(queries = %list, "no known queries in --queries; keeping defaults");
        } else {
            cfg.queries = parsed;
        }
    }
    if cfg.queries.contains(&Query::Pods) {
        warn!("pods query enabled; pods have no dashboard link and every listed pod is skipped");
    }
    if let Some(cap) = cli.metric_capacity {
        cfg.metric_capacity = cap.max(2);
    }
    if let Commands::Run { interval_secs, carry_history, .. } = &cli.command {
        if let Some(secs) = interval_secs {
            cfg.interval = Duration::from_secs((*secs).max(1));
        }
        if *carry_history {
            cfg.carry_metric_history = true;
        }
    }
    cfg
}

/// Connect and probe once; failing here is a configuration problem, not a round failure.
async fn connect_source() -> Result<Arc<dyn ResourceSource>> {
    let source = KubeSource::connect().await?;
    source.probe().await.context("resource source unreachable at startup")?;
    Ok(Arc::new(source))
}

fn print_report(output: Output, handle: &ReportHandle) -> Result<()> {
    match output {
        Output::Json => println!("{}", handle.render_pretty()?),
        Output::Human => print_summary(&handle.current()),
    }
    Ok(())
}

fn print_summary(report: &Report) {
    println!("PARTITION     NODES  META  TABLES  METRICS");
    for key in PartitionKey::ALL {
        let t = report.topology(key);
        println!(
            "{:<13} {:<6} {:<5} {:<7} {}",
            key.as_str(),
            t.nodes.len(),
            t.metadata_templates.len(),
            t.table_templates.len(),
            t.metric_templates.len()
        );
    }
}

const ALL_QUERIES: [Query; 5] = [Query::DaemonSets, Query::Deployments, Query::StatefulSets, Query::Services, Query::Pods];

fn query_note(q: Query) -> &'static str {
    match q {
        Query::Pods => " (opt-in; lists all pods, none get a link, every record is skipped)",
        q if Query::DEFAULT.contains(&q) => "",
        _ => " (opt-in)",
    }
}

fn kinds_table() -> Vec<String> {
    let mut out = vec!["QUERY         KIND          PARTITION     ID".to_string()];
    for q in ALL_QUERIES {
        let kind = q.kind();
        out.push(format!(
            "{:<13} {:<13} {:<13} <uid>;{}{}",
            q.name(),
            kind.to_string(),
            kind.partition().as_str(),
            kind.tag(),
            query_note(q)
        ));
    }
    out
}

fn write_report(path: &std::path::Path, handle: &ReportHandle) -> Result<()> {
    let bytes = handle.render()?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Kinds => {
            for line in kinds_table() {
                println!("{}", line);
            }
        }
        Commands::Once => {
            let cfg = aggregator_config(&cli);
            let links = link_config(&cli);
            info!(dashboard = %links.dashboard_url, queries = cfg.queries.len(), "once invoked");
            let source = connect_source().await?;
            let agg = Aggregator::new(source, Arc::new(LinkExtractor::new(links)), cfg);
            let stats = agg.run_round().await?;
            info!(records = stats.records, skipped = stats.skipped, nodes = stats.nodes, "round done");
            print_report(cli.output, &agg.handle())?;
        }
        Commands::Run { out, .. } => {
            let cfg = aggregator_config(&cli);
            let links = link_config(&cli);
            info!(
                dashboard = %links.dashboard_url,
                interval_secs = cfg.interval.as_secs(),
                carry_history = cfg.carry_metric_history,
                "run invoked"
            );
            let source = connect_source().await?;
            let agg = Arc::new(Aggregator::new(source, Arc::new(LinkExtractor::new(links)), cfg));
            let (handle, scheduler) = spawn_scheduler(agg);
            let mut rx = handle.subscribe_epoch();
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            warn!("epoch channel closed; exiting run loop");
                            break;
                        }
                        let res = match out.as_deref() {
                            Some(path) => write_report(path, &handle),
                            None => print_report(cli.output, &handle),
                        };
                        if let Err(e) = res {
                            // the published report is untouched; the next epoch retries
                            error!(error = ?e, "emitting report failed");
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down");
                        break;
                    }
                }
            }
            scheduler.abort();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_table_marks_pods_as_skipped() {
        let rows = kinds_table();
        assert_eq!(rows.len(), 1 + ALL_QUERIES.len());
        let pods = rows.iter().find(|r| r.starts_with("pods")).unwrap();
        assert!(pods.contains("every record is skipped"));
        let deploy = rows.iter().find(|r| r.starts_with("deployments")).unwrap();
        assert!(!deploy.contains("opt-in"));
    }

    #[test]
    fn pods_query_parses_from_cli_flag() {
        let cli = Cli::parse_from(["scopelinkctl", "--queries", "deploy,pods", "once"]);
        let cfg = aggregator_config(&cli);
        assert_eq!(cfg.queries, vec![Query::Deployments, Query::Pods]);
    }
}

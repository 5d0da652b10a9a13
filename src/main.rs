use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use vulnscan_rs::config::{ScanConfig, DEFAULT_NOT_VULNERABLE_FILE, DEFAULT_RESULTS_FILE};
use vulnscan_rs::probe::TcpProbe;
use vulnscan_rs::progress::ProgressStore;
use vulnscan_rs::rules::RulesFile;
use vulnscan_rs::{http, logging, ports, server, Orchestrator, StopReason, TargetFeed};

/// vulnscan-rs — probe, fingerprint and verify networked devices at scale.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "vulnscan-rs",
    version,
    about = "Concurrent vulnerability-scan orchestrator for cameras and other networked devices.",
    long_about = None
)]
struct Cli {
    /// Targets (ip, ip:port, CIDR or a-b range), comma separated.
    #[arg(long, value_delimiter = ',', conflicts_with = "target_file")]
    targets: Vec<String>,

    /// File with one target per line; `-` reads stdin.
    #[arg(short = 'i', long = "target-file")]
    target_file: Option<PathBuf>,

    /// Ports to probe, e.g. `80,8000-8010`. Defaults to common camera ports.
    #[arg(short, long, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// Ports list file (one port or range per line).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Per-operation timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 3000)]
    timeout_ms: u64,

    /// Max concurrent scan tasks.
    #[arg(short = 't', long, default_value_t = 300)]
    concurrency: usize,

    /// Output directory for results, checkpoint and snapshots.
    #[arg(short, long = "out-dir", default_value = "output")]
    out_dir: PathBuf,

    #[arg(long = "results-file", default_value = DEFAULT_RESULTS_FILE)]
    results_file: String,

    #[arg(long = "not-vulnerable-file", default_value = DEFAULT_NOT_VULNERABLE_FILE)]
    not_vulnerable_file: String,

    /// Skip evidence capture for confirmed findings.
    #[arg(long = "no-snapshot", default_value_t = false)]
    no_snapshot: bool,

    #[arg(long = "snapshot-workers", default_value_t = 1)]
    snapshot_workers: usize,

    /// JSON file with fingerprint rules and checks.
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Continue from the checkpoint in the output directory.
    #[arg(long, default_value_t = false)]
    resume: bool,

    #[arg(long = "status-interval-ms", default_value_t = 500)]
    status_interval_ms: u64,

    /// Serve a read-only status API on this address, e.g. 127.0.0.1:8080.
    #[arg(long = "serve-status")]
    serve_status: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long = "log-file")]
    log_file: Option<PathBuf>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

impl Cli {
    fn scan_config(&self) -> Result<ScanConfig> {
        let ports = match (&self.ports, &self.ports_file) {
            (Some(list), _) => ports::parse_ports_str(list)?,
            (None, Some(path)) => ports::load_ports_from_path(path)?,
            (None, None) => ports::default_ports(),
        };
        let config = ScanConfig {
            ports,
            timeout: Duration::from_millis(self.timeout_ms),
            concurrency: self.concurrency,
            out_dir: self.out_dir.clone(),
            results_file: self.results_file.clone(),
            not_vulnerable_file: self.not_vulnerable_file.clone(),
            snapshot_enabled: !self.no_snapshot,
            snapshot_workers: self.snapshot_workers,
            status_interval: Duration::from_millis(self.status_interval_ms),
            ..ScanConfig::default()
        };
        Ok(config.validate()?)
    }

    fn feed(&self) -> Result<TargetFeed> {
        match &self.target_file {
            Some(path) if path.as_os_str() == "-" => {
                Ok(TargetFeed::from_reader(BufReader::new(std::io::stdin()), None))
            }
            Some(path) => TargetFeed::from_file(path),
            None if !self.targets.is_empty() => Ok(TargetFeed::from_lines(self.targets.clone())),
            None => bail!("no targets: pass --targets or --target-file"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.log_file.as_deref())?;

    let config = Arc::new(cli.scan_config()?);
    let mut feed = cli.feed()?;

    let rules = match &cli.rules {
        Some(path) => RulesFile::load(path)?,
        None => {
            warn!("no rules file given; open ports will not be fingerprinted");
            RulesFile::default()
        }
    };
    let client = http::build_client(config.timeout)?;
    let fingerprinter = Arc::new(rules.fingerprinter(client.clone())?);
    let registry = Arc::new(rules.registry(client)?);

    let checkpoint = if cli.resume {
        let cp = ProgressStore::load_checkpoint(config.checkpoint_path()).await?;
        match &cp {
            Some(cp) => {
                let skipped = feed.resume(cp);
                info!(
                    "resuming: skipped {skipped} target(s), {} more completed later in the feed, {} finding(s) so far",
                    cp.completed_ahead.len(),
                    cp.found
                );
            }
            None => info!("no checkpoint found; starting from the beginning"),
        }
        cp
    } else {
        None
    };

    let progress = Arc::new(
        ProgressStore::open(&config, feed.total(), checkpoint.as_ref())
            .await
            .context("failed to prepare output files")?,
    );

    let orchestrator = Orchestrator::new(
        config.clone(),
        progress,
        Arc::new(TcpProbe),
        fingerprinter,
        registry,
    );

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if let Some(bind) = cli.serve_status.clone() {
        let state = server::AppState::new(orchestrator.status_handle(), config.results_path());
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                error!("status server error: {e:#}");
            }
        });
    }

    let summary = orchestrator.run(feed).await;
    match summary.stop {
        StopReason::Completed => info!(
            "finished: {} target(s) scanned, {} finding(s)",
            summary.done, summary.found
        ),
        StopReason::Interrupted => info!("interrupted after {} target(s)", summary.done),
        StopReason::Failed => warn!(
            "stopped on error after {} target(s); partial results kept in {}",
            summary.done,
            config.out_dir.display()
        ),
    }

    Ok(())
}

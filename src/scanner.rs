use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::fingerprint::Fingerprinter;
use crate::poc::PocRegistry;
use crate::probe::PortProbe;
use crate::progress::ProgressStore;
use crate::snapshot::{PendingSnapshotJob, SnapshotQueue};
use crate::types::{NegativeRecord, ServiceMatch, Target, VulnerabilityRecord};

/// Everything a scan task needs. Cloned into every spawned task.
#[derive(Clone)]
pub struct ScanContext {
    pub config: Arc<ScanConfig>,
    pub probe: Arc<dyn PortProbe>,
    pub fingerprinter: Arc<dyn Fingerprinter>,
    pub registry: Arc<PocRegistry>,
    pub progress: Arc<ProgressStore>,
    /// `None` when snapshots are disabled.
    pub snapshots: Option<SnapshotQueue>,
    pub cancel: CancellationToken,
}

/// What happened on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortOutcome {
    Closed,
    Unidentified,
    Fingerprinted { product: String, findings: usize },
}

/// Summary of one target, mostly for tests and debug logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetOutcome {
    pub open: usize,
    pub findings: usize,
    pub errors: usize,
    /// Set when the run was interrupted before every port was tried.
    pub interrupted: bool,
}

/// Scan one target: probe each port, fingerprint open ones, run the matching
/// checks and record the results.
///
/// Never fails. Collaborator errors (and panics) are contained to the port
/// they happened on. Completion is recorded exactly once, unless the run is
/// interrupted first, in which case the target is left for a resumed run.
pub async fn scan_target(ctx: &ScanContext, position: u64, target: Target) -> TargetOutcome {
    let ip = target.address;
    let ports: &[u16] = match &target.explicit_port {
        Some(p) => std::slice::from_ref(p),
        None => &ctx.config.ports,
    };

    let mut outcome = TargetOutcome::default();
    for &port in ports {
        if ctx.cancel.is_cancelled() {
            outcome.interrupted = true;
            return outcome;
        }

        match AssertUnwindSafe(scan_port(ctx, ip, port)).catch_unwind().await {
            Ok(Ok(PortOutcome::Closed)) => debug!("{ip}:{port} closed"),
            Ok(Ok(PortOutcome::Unidentified)) => outcome.open += 1,
            Ok(Ok(PortOutcome::Fingerprinted { findings, .. })) => {
                outcome.open += 1;
                outcome.findings += findings;
            }
            Ok(Err(e)) => {
                outcome.errors += 1;
                warn!("[{}] {e}", e.class());
            }
            Err(_) => {
                outcome.errors += 1;
                error!("{ip}:{port} scan panicked; continuing with next port");
            }
        }
    }

    ctx.progress.increment_done();
    if let Err(e) = ctx.progress.checkpoint(position, outcome.findings as u64).await {
        warn!("[{}] checkpoint after {target}: {e}", e.class());
    }
    outcome
}

async fn scan_port(ctx: &ScanContext, ip: IpAddr, port: u16) -> Result<PortOutcome, ScanError> {
    if !ctx.probe.is_open(ip, port, ctx.config.timeout).await? {
        return Ok(PortOutcome::Closed);
    }
    info!("{ip} port {port} is open");

    let Some(product) = ctx.fingerprinter.identify(ip, port, &ctx.config).await? else {
        return Ok(PortOutcome::Unidentified);
    };
    info!("{ip}:{port} is {product}");

    let service = ServiceMatch { ip, port, product };
    let Verification { verified, recorded } = verify_service(ctx, &service).await;
    if verified == 0 {
        ctx.progress
            .append_not_vulnerable(&NegativeRecord::from(service.clone()))
            .await?;
    }
    Ok(PortOutcome::Fingerprinted { product: service.product, findings: recorded })
}

/// Checks that confirmed a finding, and how many of those reached the log.
#[derive(Debug, Default, Clone, Copy)]
struct Verification {
    verified: usize,
    recorded: usize,
}

/// Run every check registered for the product, in order. A check that
/// succeeds does not stop the others: co-resident flaws are all reported.
/// A finding is counted once it is in the log.
async fn verify_service(ctx: &ScanContext, service: &ServiceMatch) -> Verification {
    let ServiceMatch { ip, port, product } = service;
    let mut outcome = Verification::default();

    for poc in ctx.registry.lookup(product) {
        let fields = match AssertUnwindSafe(poc.verify(*ip, *port)).catch_unwind().await {
            Ok(Ok(Some(fields))) => fields,
            Ok(Ok(None)) => continue,
            Ok(Err(e)) => {
                warn!("[{}] {e}", e.class());
                continue;
            }
            Err(_) => {
                error!("check {} panicked on {ip}:{port}", poc.name());
                continue;
            }
        };

        let record = match VulnerabilityRecord::new(fields) {
            Ok(r) => r,
            Err(e) => {
                warn!("check {} on {ip}:{port} returned a bad record: {e}", poc.name());
                continue;
            }
        };

        outcome.verified += 1;
        if let Err(e) = ctx.progress.append_vulnerable(&record).await {
            error!(
                "[{}] finding {} on {ip}:{port} not recorded: {e}",
                e.class(),
                record.device_vuln_id()
            );
            continue;
        }
        outcome.recorded += 1;
        ctx.progress.increment_found();
        info!("{ip}:{port} {} is vulnerable to {}", product, record.vulnerability_name());

        if let Some(queue) = &ctx.snapshots {
            let job = PendingSnapshotJob { exploit: poc.clone(), record };
            if !queue.enqueue(job) {
                debug!("snapshot pipeline closed; skipping capture for {ip}:{port}");
            }
        }
    }

    outcome
}

use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::fingerprint::Fingerprinter;
use crate::poc::PocRegistry;
use crate::probe::PortProbe;
use crate::progress::{now_rfc3339, ProgressStore};
use crate::report::Report;
use crate::scanner::{self, ScanContext};
use crate::snapshot::{DrainOutcome, SnapshotPipeline};
use crate::status::{StatusHandle, StatusObserver};
use crate::targets::TargetFeed;

/// Lifecycle of a run. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Idle,
    Running,
    Draining,
    Reporting,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Draining => "draining",
            RunState::Reporting => "reporting",
            RunState::Done => "done",
        };
        f.write_str(s)
    }
}

/// Why the run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Feed exhausted and every dispatched task finished.
    Completed,
    Interrupted,
    /// The control loop failed; partial results are kept.
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop: StopReason,
    pub total: Option<u64>,
    pub done: u64,
    pub found: u64,
    pub snapshots: DrainOutcome,
    /// Present only when the run completed and the log holds findings.
    pub report: Option<Report>,
}

/// Owns one scan run: dispatches targets into a bounded pool, drains the
/// snapshot pipeline and renders the report.
pub struct Orchestrator {
    config: Arc<ScanConfig>,
    probe: Arc<dyn PortProbe>,
    fingerprinter: Arc<dyn Fingerprinter>,
    registry: Arc<PocRegistry>,
    progress: Arc<ProgressStore>,
    snapshots_outstanding: Arc<AtomicI64>,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<ScanConfig>,
        progress: Arc<ProgressStore>,
        probe: Arc<dyn PortProbe>,
        fingerprinter: Arc<dyn Fingerprinter>,
        registry: Arc<PocRegistry>,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            config,
            probe,
            fingerprinter,
            registry,
            progress,
            snapshots_outstanding: Arc::new(AtomicI64::new(0)),
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Cancelling this token stops dispatch and triggers a clean stop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(
            self.progress.clone(),
            self.snapshots_outstanding.clone(),
            self.state.subscribe(),
        )
    }

    fn enter(&self, next: RunState) {
        self.state.send_replace(next);
        info!("run state: {next}");
    }

    /// Run to completion. Never fails: errors in the control loop are logged
    /// and handled like an interrupt, keeping whatever was recorded.
    pub async fn run(&self, mut feed: TargetFeed) -> RunSummary {
        info!("running at {}", now_rfc3339());
        info!("config is {:?}", self.config);
        info!(
            "{} target(s), {} check(s) for {} product(s)",
            feed.total().map(|t| t.to_string()).unwrap_or_else(|| "unknown".into()),
            self.registry.len(),
            self.registry.products()
        );

        self.enter(RunState::Running);
        let status = StatusObserver::spawn(self.status_handle(), self.config.status_interval);
        let pipeline = self.config.snapshot_enabled.then(|| {
            SnapshotPipeline::start_with_counter(
                self.config.snapshot_dir(),
                self.config.snapshot_workers,
                self.snapshots_outstanding.clone(),
            )
        });

        let ctx = ScanContext {
            config: self.config.clone(),
            probe: self.probe.clone(),
            fingerprinter: self.fingerprinter.clone(),
            registry: self.registry.clone(),
            progress: self.progress.clone(),
            snapshots: pipeline.as_ref().and_then(SnapshotPipeline::queue),
            cancel: self.cancel.clone(),
        };

        let mut pool = JoinSet::new();
        let dispatched = self.dispatch(&mut feed, &mut pool, ctx).await;
        let stop = match dispatched {
            Ok(()) if self.cancel.is_cancelled() => StopReason::Interrupted,
            Ok(()) => StopReason::Completed,
            Err(e) => {
                error!("scan loop failed: {e:#}");
                self.cancel.cancel();
                StopReason::Failed
            }
        };

        self.enter(RunState::Draining);
        let stop = match self.join_pool(&mut pool).await {
            true if stop == StopReason::Completed => StopReason::Interrupted,
            _ => stop,
        };
        let snapshots = match pipeline {
            Some(p) => p.shutdown(self.config.snapshot_grace).await,
            None => DrainOutcome { drained: true, abandoned: 0 },
        };
        status.stop(self.config.status_grace).await;

        let report = if stop == StopReason::Completed {
            self.enter(RunState::Reporting);
            self.report()
        } else {
            info!("scan stopped ({stop:?}); skipping report");
            None
        };
        self.enter(RunState::Done);

        RunSummary {
            stop,
            total: self.progress.total(),
            done: self.progress.done(),
            found: self.progress.found(),
            snapshots,
            report,
        }
    }

    /// Feed targets into the pool, never exceeding `concurrency` tasks in
    /// flight. Consumes `ctx` so its snapshot producer is released once
    /// dispatch ends.
    async fn dispatch(
        &self,
        feed: &mut TargetFeed,
        pool: &mut JoinSet<()>,
        ctx: ScanContext,
    ) -> Result<()> {
        let sem = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                p = sem.clone().acquire_owned() => p.context("scan pool semaphore closed")?,
            };
            // The feed may be waiting on a slow reader; an interrupt still
            // has to stop dispatch right away.
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = feed.pull() => next,
            };
            let Some((position, target)) = next else {
                break;
            };

            while let Some(res) = pool.try_join_next() {
                log_join(res);
            }

            let ctx = ctx.clone();
            pool.spawn(async move {
                let _permit = permit;
                scanner::scan_target(&ctx, position, target).await;
            });
        }

        Ok(())
    }

    /// Wait for dispatched tasks. On cancellation, give them the snapshot
    /// grace period and abandon the rest. Returns whether the wait was cut
    /// short by cancellation.
    async fn join_pool(&self, pool: &mut JoinSet<()>) -> bool {
        let mut all = Box::pin(async {
            while let Some(res) = pool.join_next().await {
                log_join(res);
            }
        });

        tokio::select! {
            biased;
            _ = &mut all => return false,
            _ = self.cancel.cancelled() => {}
        }

        let finished = time::timeout(self.config.snapshot_grace, &mut all).await.is_ok();
        drop(all);
        if !finished {
            warn!("abandoning {} in-flight scan task(s)", pool.len());
            pool.abort_all();
            // Aborted tasks drop their snapshot producers here.
            while pool.join_next().await.is_some() {}
        }
        true
    }

    fn report(&self) -> Option<Report> {
        match Report::load(self.config.results_path()) {
            Ok(Some(report)) => {
                println!("\n{}", report.render());
                Some(report)
            }
            Ok(None) => {
                info!("no vulnerabilities recorded");
                None
            }
            Err(e) => {
                error!("report failed: {e:#}");
                None
            }
        }
    }
}

fn log_join(res: Result<(), JoinError>) {
    if let Err(e) = res {
        if e.is_panic() {
            error!("scan task panicked: {e}");
        }
    }
}

//! Evidence capture, decoupled from scanning.
//!
//! Scan tasks push jobs onto an unbounded queue and move on; a small pool of
//! workers pops them and runs each check's `exploit`. The outstanding count
//! rises on enqueue and falls once a job finishes, whatever its outcome.
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time;

use crate::poc::Poc;
use crate::types::VulnerabilityRecord;

/// A confirmed finding waiting for evidence capture.
pub struct PendingSnapshotJob {
    pub exploit: Arc<dyn Poc>,
    pub record: VulnerabilityRecord,
}

/// Producer side. Cheap to clone; enqueueing never waits on the workers.
#[derive(Clone)]
pub struct SnapshotQueue {
    tx: mpsc::UnboundedSender<PendingSnapshotJob>,
    outstanding: Arc<AtomicI64>,
}

impl SnapshotQueue {
    /// Returns `false` if the pipeline has already shut down; the job is dropped.
    pub fn enqueue(&self, job: PendingSnapshotJob) -> bool {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(job) {
            Ok(()) => true,
            Err(_) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// Consumer side: owns the workers.
pub struct SnapshotPipeline {
    queue: Option<SnapshotQueue>,
    outstanding: Arc<AtomicI64>,
    workers: JoinSet<()>,
}

/// Outcome of [`SnapshotPipeline::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub drained: bool,
    pub abandoned: i64,
}

impl SnapshotPipeline {
    /// Start `workers` consumers writing artifacts into `snapshot_dir`.
    pub fn start(snapshot_dir: PathBuf, workers: usize) -> Self {
        Self::start_with_counter(snapshot_dir, workers, Arc::new(AtomicI64::new(0)))
    }

    /// Like [`start`](Self::start), reporting the outstanding count through
    /// a counter the caller already shares with status readers.
    pub fn start_with_counter(
        snapshot_dir: PathBuf,
        workers: usize,
        outstanding: Arc<AtomicI64>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<PendingSnapshotJob>();
        let rx = Arc::new(Mutex::new(rx));
        let snapshot_dir = Arc::new(snapshot_dir);

        let mut set = JoinSet::new();
        for id in 0..workers.max(1) {
            let rx = rx.clone();
            let outstanding = outstanding.clone();
            let dir = snapshot_dir.clone();
            set.spawn(async move {
                if let Err(e) = tokio::fs::create_dir_all(dir.as_path()).await {
                    warn!("snapshot worker {id}: cannot create {}: {e}", dir.display());
                }
                loop {
                    // Hold the receiver lock only while waiting for the next job.
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else { break };
                    run_job(&job, dir.as_path()).await;
                    outstanding.fetch_sub(1, Ordering::AcqRel);
                }
                debug!("snapshot worker {id} stopped");
            });
        }

        Self {
            queue: Some(SnapshotQueue { tx, outstanding: outstanding.clone() }),
            outstanding,
            workers: set,
        }
    }

    /// A producer handle. `None` once shutdown has begun.
    pub fn queue(&self) -> Option<SnapshotQueue> {
        self.queue.clone()
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding() <= 0
    }

    /// Close the queue and let workers finish what is already queued, for
    /// at most `grace`. Jobs still pending afterwards are abandoned.
    ///
    /// Producers holding a cloned [`SnapshotQueue`] keep the queue open, so
    /// all scan tasks must be finished before calling this.
    pub async fn shutdown(mut self, grace: Duration) -> DrainOutcome {
        self.queue.take();
        let workers = &mut self.workers;
        let drained = time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            self.workers.abort_all();
        }
        let abandoned = self.outstanding().max(0);
        if abandoned > 0 {
            warn!("abandoning {abandoned} pending snapshot(s) after {grace:?}");
        }
        DrainOutcome { drained: drained && abandoned == 0, abandoned }
    }
}

async fn run_job(job: &PendingSnapshotJob, dir: &std::path::Path) {
    let target = format!("{}:{}", job.record.ip(), job.record.port());
    match job.exploit.exploit(&job.record, dir).await {
        Ok(Some(path)) => info!(
            "snapshot {} {} saved to {}",
            target,
            job.record.device_vuln_id(),
            path.display()
        ),
        Ok(None) => debug!("snapshot {} {}: nothing captured", target, job.record.device_vuln_id()),
        Err(e) => warn!("[{}] {e}", e.class()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    struct SlowCapture {
        delay: Duration,
        fail: bool,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl Poc for SlowCapture {
        fn name(&self) -> &str {
            "slow"
        }
        async fn verify(&self, _ip: IpAddr, _port: u16) -> Result<Option<Vec<String>>, ScanError> {
            Ok(None)
        }
        async fn exploit(
            &self,
            record: &VulnerabilityRecord,
            _dir: &Path,
        ) -> Result<Option<PathBuf>, ScanError> {
            time::sleep(self.delay).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ScanError::Exploit {
                    check: "slow".into(),
                    target: record.ip().into(),
                    reason: "boom".into(),
                });
            }
            Ok(None)
        }
    }

    fn job(poc: Arc<SlowCapture>) -> PendingSnapshotJob {
        PendingSnapshotJob {
            exploit: poc,
            record: VulnerabilityRecord::new(["1.1.1.1", "80", "cam-a", "u", "p", "n"]).unwrap(),
        }
    }

    #[tokio::test]
    async fn failed_jobs_still_count_as_done() {
        let dir = tempfile::tempdir().unwrap();
        let poc = Arc::new(SlowCapture { delay: Duration::ZERO, fail: true, runs: AtomicUsize::new(0) });
        let pipeline = SnapshotPipeline::start(dir.path().to_path_buf(), 2);
        let q = pipeline.queue().unwrap();
        for _ in 0..5 {
            assert!(q.enqueue(job(poc.clone())));
        }
        drop(q);
        let out = pipeline.shutdown(Duration::from_secs(5)).await;
        assert_eq!(out, DrainOutcome { drained: true, abandoned: 0 });
        assert_eq!(poc.runs.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn enqueue_does_not_wait_for_slow_workers() {
        let dir = tempfile::tempdir().unwrap();
        let poc = Arc::new(SlowCapture {
            delay: Duration::from_secs(3600),
            fail: false,
            runs: AtomicUsize::new(0),
        });
        let pipeline = SnapshotPipeline::start(dir.path().to_path_buf(), 1);
        let q = pipeline.queue().unwrap();

        let started = std::time::Instant::now();
        for _ in 0..1000 {
            q.enqueue(job(poc.clone()));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(q.outstanding(), 1000);
        assert!(!pipeline.is_drained());

        drop(q);
        let out = pipeline.shutdown(Duration::from_millis(100)).await;
        assert!(!out.drained);
        assert_eq!(out.abandoned, 1000);
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ScanError;

pub const DEFAULT_RESULTS_FILE: &str = "results.csv";
pub const DEFAULT_NOT_VULNERABLE_FILE: &str = "not_vulnerable.csv";
pub const CHECKPOINT_FILE: &str = "running_state.json";
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Run-wide settings. Built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Ports probed for targets without an explicit port, in order.
    pub ports: Vec<u16>,
    /// Per-operation timeout handed to the collaborators.
    pub timeout: Duration,
    /// Maximum number of scan tasks in flight.
    pub concurrency: usize,
    pub out_dir: PathBuf,
    pub results_file: String,
    pub not_vulnerable_file: String,
    pub snapshot_enabled: bool,
    pub snapshot_workers: usize,
    /// How long to wait for queued snapshots once scanning is over.
    pub snapshot_grace: Duration,
    /// How long to wait for the status observer to stop.
    pub status_grace: Duration,
    pub status_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ports: crate::ports::default_ports(),
            timeout: Duration::from_secs(3),
            concurrency: 300,
            out_dir: PathBuf::from("output"),
            results_file: DEFAULT_RESULTS_FILE.to_string(),
            not_vulnerable_file: DEFAULT_NOT_VULNERABLE_FILE.to_string(),
            snapshot_enabled: true,
            snapshot_workers: 1,
            snapshot_grace: Duration::from_secs(10),
            status_grace: Duration::from_secs(2),
            status_interval: Duration::from_millis(500),
        }
    }
}

impl ScanConfig {
    /// Check and normalise user-provided values.
    pub fn validate(mut self) -> Result<Self, ScanError> {
        if self.ports.is_empty() {
            return Err(ScanError::Config("port list is empty".into()));
        }
        if self.timeout.is_zero() {
            return Err(ScanError::Config("timeout must be greater than zero".into()));
        }
        if self.results_file.trim().is_empty() {
            return Err(ScanError::Config("results file name is empty".into()));
        }
        self.concurrency = self.concurrency.clamp(1, 5_000);
        self.snapshot_workers = self.snapshot_workers.clamp(1, 64);
        if self.status_interval.is_zero() {
            self.status_interval = Duration::from_millis(500);
        }
        Ok(self)
    }

    pub fn results_path(&self) -> PathBuf {
        self.out_dir.join(&self.results_file)
    }

    pub fn not_vulnerable_path(&self) -> PathBuf {
        self.out_dir.join(&self.not_vulnerable_file)
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.out_dir.join(CHECKPOINT_FILE)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.out_dir.join(SNAPSHOT_DIR)
    }
}

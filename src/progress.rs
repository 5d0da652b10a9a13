use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::types::{Checkpoint, NegativeRecord, VulnerabilityRecord};

/// Run-wide counters and append-only result logs.
///
/// Counters are atomics. Each log has its own writer lock so a line is
/// always written whole, and the checkpoint is rewritten under a third lock
/// so an older state never overwrites a newer one.
#[derive(Debug)]
pub struct ProgressStore {
    total: Option<u64>,
    done: AtomicU64,
    found: AtomicU64,
    vulnerable: Mutex<File>,
    not_vulnerable: Mutex<File>,
    checkpoint_path: PathBuf,
    watermark: Mutex<Watermark>,
}

/// Tracks the longest prefix of feed positions that have all completed,
/// plus what completed targets have recorded.
#[derive(Debug, Default)]
struct Watermark {
    next: u64,
    ahead: BTreeSet<u64>,
    found: u64,
}

impl Watermark {
    fn from_checkpoint(c: &Checkpoint) -> Self {
        Self {
            next: c.resume_from,
            ahead: c.completed_ahead.iter().copied().filter(|p| *p >= c.resume_from).collect(),
            found: c.found,
        }
    }

    fn complete(&mut self, position: u64, findings: u64) {
        if position < self.next || !self.ahead.insert(position) {
            return;
        }
        self.found += findings;
        while self.ahead.remove(&self.next) {
            self.next += 1;
        }
    }

    fn done(&self) -> u64 {
        self.next + self.ahead.len() as u64
    }
}

impl ProgressStore {
    /// Create the output directory and open both logs for appending.
    ///
    /// With `resume`, counters continue from the checkpoint. Targets that
    /// were in flight when it was written are scanned again and counted then.
    pub async fn open(
        config: &ScanConfig,
        total: Option<u64>,
        resume: Option<&Checkpoint>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.out_dir)
            .await
            .with_context(|| format!("failed to create output dir: {}", config.out_dir.display()))?;

        let watermark = resume.map(Watermark::from_checkpoint).unwrap_or_default();

        Ok(Self {
            total,
            done: AtomicU64::new(watermark.done()),
            found: AtomicU64::new(watermark.found),
            vulnerable: Mutex::new(open_append(&config.results_path()).await?),
            not_vulnerable: Mutex::new(open_append(&config.not_vulnerable_path()).await?),
            checkpoint_path: config.checkpoint_path(),
            watermark: Mutex::new(watermark),
        })
    }

    /// Read a previously written checkpoint, if there is one.
    pub async fn load_checkpoint(path: impl AsRef<Path>) -> Result<Option<Checkpoint>> {
        let path = path.as_ref();
        match fs::read_to_string(path).await {
            Ok(s) => serde_json::from_str(&s)
                .map(Some)
                .with_context(|| format!("corrupt checkpoint: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Acquire)
    }

    pub fn found(&self) -> u64 {
        self.found.load(Ordering::Acquire)
    }

    pub fn increment_done(&self) -> u64 {
        self.done.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn increment_found(&self) -> u64 {
        self.found.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Append the compacted finding and flush it before returning.
    pub async fn append_vulnerable(&self, record: &VulnerabilityRecord) -> Result<(), ScanError> {
        append_line(&self.vulnerable, &record.to_log_line()).await
    }

    pub async fn append_not_vulnerable(&self, record: &NegativeRecord) -> Result<(), ScanError> {
        append_line(&self.not_vulnerable, &record.to_log_line()).await
    }

    /// Mark feed `position` complete with the findings it recorded and
    /// overwrite the running-state file.
    ///
    /// The checkpoint only counts completed targets, so a resumed run never
    /// counts a finding twice.
    pub async fn checkpoint(&self, position: u64, findings: u64) -> Result<Checkpoint, ScanError> {
        let mut wm = self.watermark.lock().await;
        wm.complete(position, findings);
        let state = Checkpoint {
            done: wm.done(),
            total: self.total,
            found: wm.found,
            resume_from: wm.next,
            completed_ahead: wm.ahead.iter().copied().collect(),
            updated_at: now_rfc3339(),
        };
        let json = serde_json::to_vec(&state).map_err(std::io::Error::from)?;
        let tmp = self.checkpoint_path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.checkpoint_path).await?;
        Ok(state)
    }
}

async fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
}

async fn append_line(file: &Mutex<File>, line: &str) -> Result<(), ScanError> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    let mut f = file.lock().await;
    f.write_all(&buf).await?;
    f.flush().await?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

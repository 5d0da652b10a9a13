use std::io::{IsTerminal, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::RunState;
use crate::progress::ProgressStore;
use crate::types::StatusSnapshot;

/// Read-only view over the live run.
#[derive(Clone)]
pub struct StatusHandle {
    progress: Arc<ProgressStore>,
    snapshots: Arc<AtomicI64>,
    state: watch::Receiver<RunState>,
}

impl StatusHandle {
    pub fn new(
        progress: Arc<ProgressStore>,
        snapshots: Arc<AtomicI64>,
        state: watch::Receiver<RunState>,
    ) -> Self {
        Self { progress, snapshots, state }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            total: self.progress.total(),
            done: self.progress.done(),
            found: self.progress.found(),
            snapshots_pending: self.snapshots.load(Ordering::Acquire),
            state: self.state.borrow().to_string(),
        }
    }
}

/// `[00:01:05] 120/1000 (12.00%) found 3 snapshots 1 running`
pub fn render_line(s: &StatusSnapshot, elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let clock = format!("{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
    let progress = match s.total {
        Some(total) if total > 0 => {
            format!("{}/{} ({:.2}%)", s.done, total, s.done as f64 / total as f64 * 100.0)
        }
        Some(total) => format!("{}/{}", s.done, total),
        None => format!("{}/?", s.done),
    };
    format!(
        "[{clock}] {progress} found {} snapshots {} {}",
        s.found,
        s.snapshots_pending.max(0),
        s.state
    )
}

/// Overwrite the current terminal line.
fn redraw(out: &mut impl Write, line: &str) -> std::io::Result<()> {
    write!(out, "\r{line}\x1b[K")?;
    out.flush()
}

/// Periodically renders the run status on stderr.
pub struct StatusObserver {
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl StatusObserver {
    pub fn spawn(source: StatusHandle, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let task = tokio::spawn(async move {
            let started = Instant::now();
            let tty = std::io::stderr().is_terminal();
            let mut tick = time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let line = render_line(&source.snapshot(), started.elapsed());
                        if tty {
                            if let Err(e) = redraw(&mut std::io::stderr().lock(), &line) {
                                debug!("status line not drawn: {e}");
                            }
                        } else {
                            debug!("{line}");
                        }
                    }
                }
            }
            let line = render_line(&source.snapshot(), started.elapsed());
            if tty {
                eprintln!("\r{line}\x1b[K");
            }
            info!("{line}");
        });
        Self { task, stop }
    }

    /// Signal the observer and wait up to `grace` for its final render.
    pub async fn stop(self, grace: Duration) {
        self.stop.cancel();
        let mut task = self.task;
        if time::timeout(grace, &mut task).await.is_err() {
            task.abort();
        }
    }
}

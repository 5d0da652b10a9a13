//! Pull-based target feed.
//!
//! A feed yields [`Target`]s on demand from a line source. Each line is one of
//! `ip`, `ip:port`, an IPv4 CIDR (`10.0.0.0/24`) or an inclusive IPv4 range
//! (`10.0.0.1-10.0.0.20`). Ranges are iterated, never materialised, so a feed
//! over a `/8` costs the same memory as one over a single host.
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr};
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use log::{error, warn};
use tokio::sync::mpsc;

use crate::error::ScanError;
use crate::types::{Checkpoint, Target};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Single(Target),
    /// Inclusive numeric IPv4 range.
    Range { start: u32, end: u32 },
}

impl TargetSpec {
    /// Parse one line. Returns `Ok(None)` for blank lines and comments.
    pub fn parse_line(raw: &str) -> Result<Option<Self>, ScanError> {
        let line = raw.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            return Ok(None);
        }

        if line.contains('/') {
            return match line.parse::<IpNet>() {
                Ok(IpNet::V4(net)) => Ok(Some(Self::from_ipv4_net(net))),
                Ok(IpNet::V6(_)) => Err(ScanError::InvalidTarget(format!(
                    "{line}: IPv6 networks are not expanded"
                ))),
                Err(_) => Err(ScanError::InvalidTarget(line.to_string())),
            };
        }

        if let Some((a, b)) = line.split_once('-') {
            let start = a.trim().parse::<Ipv4Addr>();
            let end = b.trim().parse::<Ipv4Addr>();
            return match (start, end) {
                (Ok(s), Ok(e)) if u32::from(s) <= u32::from(e) => {
                    Ok(Some(Self::Range { start: s.into(), end: e.into() }))
                }
                _ => Err(ScanError::InvalidTarget(line.to_string())),
            };
        }

        line.parse::<Target>().map(|t| Some(Self::Single(t)))
    }

    /// Hosts of a network, without network and broadcast addresses when the
    /// prefix leaves room for them.
    fn from_ipv4_net(net: Ipv4Net) -> Self {
        let start = u32::from(net.network());
        let end = u32::from(net.broadcast());
        if net.prefix_len() >= 31 {
            Self::Range { start, end }
        } else {
            Self::Range { start: start + 1, end: end - 1 }
        }
    }

    pub fn host_count(&self) -> u64 {
        match self {
            Self::Single(_) => 1,
            Self::Range { start, end } => u64::from(end - start) + 1,
        }
    }
}

/// Number of targets a line source will produce, without expanding it.
pub fn count_targets<I, S>(lines: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|l| TargetSpec::parse_line(l.as_ref()).ok().flatten())
        .map(|spec| spec.host_count())
        .sum()
}

/// Expands a stream of lines into targets, one at a time.
struct Expander<L> {
    lines: L,
    current: Option<(u32, u32)>,
}

impl<L> Iterator for Expander<L>
where
    L: Iterator<Item = String>,
{
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        loop {
            if let Some((next, end)) = self.current {
                self.current = if next < end { Some((next + 1, end)) } else { None };
                return Some(Target::new(IpAddr::V4(Ipv4Addr::from(next))));
            }

            let line = self.lines.next()?;
            match TargetSpec::parse_line(&line) {
                Ok(Some(TargetSpec::Single(t))) => return Some(t),
                Ok(Some(TargetSpec::Range { start, end })) => self.current = Some((start, end)),
                Ok(None) => {}
                Err(e) => warn!("skipping input line: {e}"),
            }
        }
    }
}

/// Targets expanded lazily from a line source.
type TargetIter = Box<dyn Iterator<Item = Target> + Send>;

/// Targets buffered between the reader thread and the dispatcher.
const READ_AHEAD: usize = 1024;

enum Source {
    /// Pulled directly; reading never blocks.
    Ready(TargetIter),
    /// Backed by a reader that may block (stdin, a pipe). Moved onto its own
    /// thread on the first async pull.
    Blocking(TargetIter),
    Channel(mpsc::Receiver<Target>),
    Closed,
}

/// A finite or unbounded, non-restartable sequence of targets.
pub struct TargetFeed {
    source: Source,
    total: Option<u64>,
    position: u64,
    /// Positions past the resume point that already completed.
    completed: BTreeSet<u64>,
}

impl TargetFeed {
    /// Feed over an in-memory list of lines; the total is known.
    pub fn from_lines(lines: Vec<String>) -> Self {
        let total = count_targets(&lines);
        let expander = Expander { lines: lines.into_iter(), current: None };
        Self::new(Source::Ready(Box::new(expander)), Some(total))
    }

    /// Feed over a file. A counting pass establishes the total before the
    /// file is re-read lazily.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let open = || {
            File::open(path)
                .map(BufReader::new)
                .with_context(|| format!("failed to open target file: {}", path.display()))
        };
        let total = count_targets(open()?.lines().map_while(std::io::Result::ok));
        Ok(Self::from_reader(open()?, Some(total)))
    }

    /// Feed over an arbitrary reader (e.g. stdin). Read errors end the feed.
    pub fn from_reader<R>(reader: R, total: Option<u64>) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let lines = reader.lines().map_while(|l| match l {
            Ok(l) => Some(l),
            Err(e) => {
                warn!("target input ended early: {e}");
                None
            }
        });
        Self::new(Source::Blocking(Box::new(Expander { lines, current: None })), total)
    }

    fn new(source: Source, total: Option<u64>) -> Self {
        Self { source, total, position: 0, completed: BTreeSet::new() }
    }

    /// Total number of targets, if known in advance.
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Number of targets handed out (or skipped) so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Discard the first `n` targets. Returns how many were actually skipped.
    pub fn skip_targets(&mut self, n: u64) -> u64 {
        let mut skipped = 0;
        while skipped < n && self.next_raw().is_some() {
            skipped += 1;
        }
        skipped
    }

    /// Position the feed after a checkpoint: skip the completed prefix now
    /// and the completed positions beyond it as they come up.
    /// Returns the number of prefix targets skipped.
    pub fn resume(&mut self, checkpoint: &Checkpoint) -> u64 {
        let skipped = self.skip_targets(checkpoint.resume_from);
        self.completed.extend(
            checkpoint
                .completed_ahead
                .iter()
                .copied()
                .filter(|p| *p >= self.position),
        );
        skipped
    }

    /// Next target with its zero-based feed position, without waiting on a
    /// reader. Use [`pull`](Self::pull) from async code.
    pub fn next_indexed(&mut self) -> Option<(u64, Target)> {
        loop {
            let (idx, t) = self.next_raw()?;
            if !self.completed.remove(&idx) {
                return Some((idx, t));
            }
        }
    }

    pub fn next_target(&mut self) -> Option<Target> {
        self.next_indexed().map(|(_, t)| t)
    }

    /// Async variant of [`next_indexed`](Self::next_indexed). Blocking
    /// readers are drained on a dedicated thread, so awaiting this is
    /// cancel-safe and never stalls the runtime.
    pub async fn pull(&mut self) -> Option<(u64, Target)> {
        if matches!(self.source, Source::Blocking(_)) {
            self.spawn_reader();
        }
        loop {
            let t = match &mut self.source {
                Source::Channel(rx) => rx.recv().await,
                Source::Ready(it) | Source::Blocking(it) => it.next(),
                Source::Closed => None,
            }?;
            let idx = self.position;
            self.position += 1;
            if !self.completed.remove(&idx) {
                return Some((idx, t));
            }
        }
    }

    // After the first `pull` a blocking source is a channel; reading it
    // synchronously from then on must happen outside the runtime.
    fn next_raw(&mut self) -> Option<(u64, Target)> {
        let t = match &mut self.source {
            Source::Ready(it) | Source::Blocking(it) => it.next(),
            Source::Channel(rx) => rx.blocking_recv(),
            Source::Closed => None,
        }?;
        let idx = self.position;
        self.position += 1;
        Some((idx, t))
    }

    // The thread is detached: a reader stuck on an idle stdin must not
    // hold up shutdown. It exits once the feed is dropped and it next
    // produces a target.
    fn spawn_reader(&mut self) {
        let Source::Blocking(it) = std::mem::replace(&mut self.source, Source::Closed) else {
            return;
        };
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        let spawned = thread::Builder::new()
            .name("target-reader".into())
            .spawn(move || {
                for t in it {
                    if tx.blocking_send(t).is_err() {
                        break;
                    }
                }
            });
        match spawned {
            Ok(_) => self.source = Source::Channel(rx),
            Err(e) => error!("cannot start target reader thread: {e}"),
        }
    }
}

impl Iterator for TargetFeed {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        self.next_target()
    }
}

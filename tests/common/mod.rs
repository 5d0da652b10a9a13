#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vulnscan_rs::config::ScanConfig;
use vulnscan_rs::fingerprint::Fingerprinter;
use vulnscan_rs::poc::{Poc, PocRegistry};
use vulnscan_rs::probe::PortProbe;
use vulnscan_rs::progress::ProgressStore;
use vulnscan_rs::{Orchestrator, ScanError, VulnerabilityRecord};

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn test_config(out_dir: &Path, ports: Vec<u16>) -> ScanConfig {
    ScanConfig {
        ports,
        timeout: Duration::from_secs(1),
        concurrency: 8,
        out_dir: out_dir.to_path_buf(),
        snapshot_grace: Duration::from_secs(5),
        status_grace: Duration::from_secs(1),
        status_interval: Duration::from_millis(50),
        ..ScanConfig::default()
    }
}

/// Ports listed in `open` are open; everything else is closed.
#[derive(Default)]
pub struct MockProbe {
    pub open: HashSet<(IpAddr, u16)>,
    pub open_everywhere: bool,
    pub delay: Duration,
    /// These addresses never answer within a test's lifetime.
    pub stall: HashSet<IpAddr>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockProbe {
    pub fn open(pairs: &[(&str, u16)]) -> Self {
        Self {
            open: pairs.iter().map(|(a, p)| (ip(a), *p)).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl PortProbe for MockProbe {
    async fn is_open(&self, ip: IpAddr, port: u16, _timeout: Duration) -> Result<bool, ScanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.stall.contains(&ip) {
            tokio::time::sleep(Duration::from_secs(600)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.open_everywhere || self.open.contains(&(ip, port)))
    }
}

/// Every open port is the same product, unless a per-address entry says otherwise.
#[derive(Default)]
pub struct MockFingerprinter {
    pub default: Option<String>,
    pub by_ip: HashMap<IpAddr, String>,
    pub fail_for: HashSet<IpAddr>,
}

impl MockFingerprinter {
    pub fn always(product: &str) -> Self {
        Self { default: Some(product.to_string()), ..Self::default() }
    }
}

#[async_trait]
impl Fingerprinter for MockFingerprinter {
    async fn identify(
        &self,
        ip: IpAddr,
        port: u16,
        _config: &ScanConfig,
    ) -> Result<Option<String>, ScanError> {
        if self.fail_for.contains(&ip) {
            return Err(ScanError::Fingerprint { ip, port, reason: "mock failure".into() });
        }
        Ok(self.by_ip.get(&ip).cloned().or_else(|| self.default.clone()))
    }
}

pub enum Behavior {
    /// Vulnerable everywhere; fields are `ip, port, id, user, pass, name, extra`.
    Hit { id: &'static str, name: &'static str },
    Miss,
    /// Errors for this address, hits elsewhere.
    FailFor { addr: IpAddr, id: &'static str, name: &'static str },
    /// Panics for this address, misses elsewhere.
    PanicFor(IpAddr),
    /// Returns a record that is too short to be valid.
    Malformed,
}

pub struct MockPoc {
    pub name: String,
    pub behavior: Behavior,
    pub verifies: AtomicUsize,
    pub exploits: AtomicUsize,
    pub exploit_delay: Duration,
}

impl MockPoc {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Self::slow(name, behavior, Duration::ZERO)
    }

    /// Capture sleeps for `exploit_delay` before writing anything.
    pub fn slow(name: &str, behavior: Behavior, exploit_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            verifies: AtomicUsize::new(0),
            exploits: AtomicUsize::new(0),
            exploit_delay,
        })
    }

    fn fields(ip: IpAddr, port: u16, id: &str, name: &str) -> Vec<String> {
        vec![
            ip.to_string(),
            port.to_string(),
            id.to_string(),
            "admin".into(),
            "12345".into(),
            name.to_string(),
            "http://evidence".into(),
        ]
    }
}

#[async_trait]
impl Poc for MockPoc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, ip: IpAddr, port: u16) -> Result<Option<Vec<String>>, ScanError> {
        self.verifies.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Hit { id, name } => Ok(Some(Self::fields(ip, port, id, name))),
            Behavior::Miss => Ok(None),
            Behavior::FailFor { addr, .. } if *addr == ip => Err(ScanError::Verify {
                check: self.name.clone(),
                ip,
                port,
                reason: "mock failure".into(),
            }),
            Behavior::FailFor { id, name, .. } => Ok(Some(Self::fields(ip, port, id, name))),
            Behavior::PanicFor(addr) if *addr == ip => panic!("check blew up"),
            Behavior::PanicFor(_) => Ok(None),
            Behavior::Malformed => Ok(Some(vec![ip.to_string(), port.to_string()])),
        }
    }

    async fn exploit(
        &self,
        record: &VulnerabilityRecord,
        snapshot_dir: &Path,
    ) -> Result<Option<PathBuf>, ScanError> {
        if !self.exploit_delay.is_zero() {
            tokio::time::sleep(self.exploit_delay).await;
        }
        self.exploits.fetch_add(1, Ordering::SeqCst);
        let file = snapshot_dir.join(format!("{}-{}.txt", record.ip(), record.port()));
        tokio::fs::write(&file, record.fields().join(",")).await?;
        Ok(Some(file))
    }
}

pub fn registry(entries: Vec<(&str, Arc<MockPoc>)>) -> PocRegistry {
    let mut reg = PocRegistry::new();
    for (product, poc) in entries {
        reg.register(product, poc);
    }
    reg
}

pub async fn orchestrator(
    config: ScanConfig,
    total: Option<u64>,
    probe: Arc<MockProbe>,
    fingerprinter: MockFingerprinter,
    registry: PocRegistry,
) -> Orchestrator {
    let config = Arc::new(config);
    let progress = Arc::new(ProgressStore::open(&config, total, None).await.unwrap());
    Orchestrator::new(config, progress, probe, Arc::new(fingerprinter), Arc::new(registry))
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

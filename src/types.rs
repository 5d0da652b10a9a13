use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;

/// Number of leading fields of a finding that are written to the result log.
pub const PERSISTED_FIELDS: usize = 6;

/// One address to scan, optionally pinned to a single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target {
    pub address: IpAddr,
    pub explicit_port: Option<u16>,
}

impl Target {
    pub fn new(address: IpAddr) -> Self {
        Self { address, explicit_port: None }
    }

    pub fn with_port(address: IpAddr, port: u16) -> Self {
        Self { address, explicit_port: Some(port) }
    }
}

impl FromStr for Target {
    type Err = ScanError;

    /// Accepts `ip`, `ip:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(sa) = s.parse::<SocketAddr>() {
            if sa.port() == 0 {
                return Err(ScanError::InvalidTarget(s.to_string()));
            }
            return Ok(Self::with_port(sa.ip(), sa.port()));
        }
        s.parse::<IpAddr>()
            .map(Self::new)
            .map_err(|_| ScanError::InvalidTarget(s.to_string()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.explicit_port {
            Some(port) => write!(f, "{}", SocketAddr::new(self.address, port)),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A fingerprinted service on an open port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMatch {
    pub ip: IpAddr,
    pub port: u16,
    pub product: String,
}

/// A confirmed finding as returned by a PoC check.
///
/// Field layout: `ip, port, <device>-<vulnId>, ...metadata..., name, ...extra`,
/// with the vulnerability name in the last persisted position.
/// The full tuple travels to the snapshot pipeline; only the first
/// [`PERSISTED_FIELDS`] are written to the result log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulnerabilityRecord {
    fields: Vec<String>,
}

impl VulnerabilityRecord {
    pub fn new<I, S>(fields: I) -> Result<Self, ScanError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| sanitize_field(&f.into()))
            .collect();
        if fields.len() < PERSISTED_FIELDS {
            return Err(ScanError::InvalidRecord(format!(
                "expected at least {PERSISTED_FIELDS} fields, got {}",
                fields.len()
            )));
        }
        match split_device_vuln(&fields[2]) {
            Some(_) => Ok(Self { fields }),
            None => Err(ScanError::InvalidRecord(format!(
                "third field `{}` is not <device>-<vulnId>",
                fields[2]
            ))),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn ip(&self) -> &str {
        &self.fields[0]
    }

    pub fn port(&self) -> &str {
        &self.fields[1]
    }

    pub fn device_vuln_id(&self) -> &str {
        &self.fields[2]
    }

    pub fn device(&self) -> &str {
        split_device_vuln(&self.fields[2]).map(|(d, _)| d).unwrap_or_default()
    }

    /// Last persisted field.
    pub fn vulnerability_name(&self) -> &str {
        &self.fields[PERSISTED_FIELDS - 1]
    }

    /// The compacted log line (no trailing newline).
    pub fn to_log_line(&self) -> String {
        self.fields[..PERSISTED_FIELDS].join(",")
    }
}

/// A port that fingerprinted as `product` but no check verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub product: String,
}

impl NegativeRecord {
    pub fn to_log_line(&self) -> String {
        format!("{},{},{}", self.ip, self.port, sanitize_field(&self.product))
    }
}

impl From<ServiceMatch> for NegativeRecord {
    fn from(m: ServiceMatch) -> Self {
        Self { ip: m.ip, port: m.port, product: m.product }
    }
}

/// Persisted running state, overwritten after every completed target.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    /// Targets completed: the prefix plus `completed_ahead`.
    pub done: u64,
    pub total: Option<u64>,
    /// Findings recorded by completed targets only.
    pub found: u64,
    /// Feed positions `0..resume_from` have all completed.
    pub resume_from: u64,
    /// Completed positions past the prefix, ascending.
    #[serde(default)]
    pub completed_ahead: Vec<u64>,
    pub updated_at: String,
}

/// Point-in-time view of the run, consumed by status renderers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub total: Option<u64>,
    pub done: u64,
    pub found: u64,
    pub snapshots_pending: i64,
    pub state: String,
}

/// Split `<device>-<vulnId>` at the first dash.
pub fn split_device_vuln(s: &str) -> Option<(&str, &str)> {
    match s.split_once('-') {
        Some((device, vuln)) if !device.is_empty() && !vuln.is_empty() => Some((device, vuln)),
        _ => None,
    }
}

// Keeps one finding per line and the comma as the only separator.
fn sanitize_field(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            ',' => ';',
            '\n' | '\r' => ' ',
            c => c,
        })
        .collect()
}

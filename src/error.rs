use std::net::IpAddr;

/// Classified failures raised while scanning a single port or running a job.
///
/// None of these abort a run: the scan task and snapshot workers log them
/// and move on.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("probe {ip}:{port} failed: {reason}")]
    Probe { ip: IpAddr, port: u16, reason: String },

    #[error("fingerprint {ip}:{port} failed: {reason}")]
    Fingerprint { ip: IpAddr, port: u16, reason: String },

    #[error("verify {check} on {ip}:{port} failed: {reason}")]
    Verify { check: String, ip: IpAddr, port: u16, reason: String },

    #[error("exploit {check} for {target} failed: {reason}")]
    Exploit { check: String, target: String, reason: String },

    #[error("result store: {0}")]
    Store(#[from] std::io::Error),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("invalid vulnerability record: {0}")]
    InvalidRecord(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl ScanError {
    /// Short class name used in log lines.
    pub fn class(&self) -> &'static str {
        match self {
            ScanError::Probe { .. } => "probe",
            ScanError::Fingerprint { .. } => "fingerprint",
            ScanError::Verify { .. } => "verify",
            ScanError::Exploit { .. } => "exploit",
            ScanError::Store(_) => "store",
            ScanError::InvalidTarget(_) => "target",
            ScanError::InvalidRecord(_) => "record",
            ScanError::Config(_) => "config",
        }
    }
}

use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;

use crate::error::ScanError;

/// Port openness check.
///
/// `Ok(false)` means closed, filtered or timed out. `Err` is reserved for
/// failures that say nothing about the port (e.g. local resource exhaustion).
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, ip: IpAddr, port: u16, timeout: Duration) -> Result<bool, ScanError>;
}

/// Plain TCP connect probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, ip: IpAddr, port: u16, timeout: Duration) -> Result<bool, ScanError> {
        let addr = SocketAddr::new(ip, port);
        match time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) if is_local_failure(e.kind()) => Err(ScanError::Probe {
                ip,
                port,
                reason: e.to_string(),
            }),
            // Refused, unreachable, reset or timed out.
            _ => Ok(false),
        }
    }
}

fn is_local_failure(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::OutOfMemory | ErrorKind::AddrNotAvailable | ErrorKind::PermissionDenied
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn detects_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let open = TcpProbe
            .is_open(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(open);
    }

    #[tokio::test]
    async fn closed_port_is_not_an_error() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let open = TcpProbe
            .is_open(IpAddr::V4(Ipv4Addr::LOCALHOST), port, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!open);
    }
}

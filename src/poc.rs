use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::ScanError;
use crate::http;
use crate::types::VulnerabilityRecord;

/// A vulnerability check for one product.
#[async_trait]
pub trait Poc: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    /// Returns the finding's fields when the target is vulnerable:
    /// `ip, port, <device>-<vulnId>, ...metadata..., name, ...extra`.
    async fn verify(&self, ip: IpAddr, port: u16) -> Result<Option<Vec<String>>, ScanError>;

    /// Capture evidence for a confirmed finding into `snapshot_dir`.
    /// Returns the artifact path, if one was written.
    async fn exploit(
        &self,
        record: &VulnerabilityRecord,
        snapshot_dir: &Path,
    ) -> Result<Option<PathBuf>, ScanError>;
}

/// Product name to ordered checks. Read-only once the run starts.
#[derive(Default, Clone)]
pub struct PocRegistry {
    by_product: HashMap<String, Vec<Arc<dyn Poc>>>,
}

impl PocRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a check to the end of `product`'s list.
    pub fn register(&mut self, product: impl Into<String>, poc: Arc<dyn Poc>) {
        self.by_product.entry(product.into()).or_default().push(poc);
    }

    /// Checks for `product` in registration order; unknown products have none.
    pub fn lookup(&self, product: &str) -> &[Arc<dyn Poc>] {
        self.by_product.get(product).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn products(&self) -> usize {
        self.by_product.len()
    }

    pub fn len(&self) -> usize {
        self.by_product.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Declarative HTTP check: vulnerable when `pattern` matches the response to `path`.
pub struct HttpPoc {
    pub device: String,
    pub vuln_id: String,
    pub name: String,
    pub path: String,
    pub pattern: Regex,
    pub user: String,
    pub password: String,
    /// Fetched by `exploit` to capture evidence; defaults to `path`.
    pub evidence_path: Option<String>,
    pub client: reqwest::Client,
}

impl HttpPoc {
    fn id(&self) -> String {
        format!("{}-{}", self.device, self.vuln_id)
    }
}

#[async_trait]
impl Poc for HttpPoc {
    fn name(&self) -> &str {
        &self.name
    }

    async fn verify(&self, ip: IpAddr, port: u16) -> Result<Option<Vec<String>>, ScanError> {
        let base = http::base_url(ip, port);
        let text = http::fetch_text(&self.client, &http::join(&base, &self.path))
            .await
            .map_err(|e| ScanError::Verify {
                check: self.id(),
                ip,
                port,
                reason: e.to_string(),
            })?;
        if !self.pattern.is_match(&text) {
            return Ok(None);
        }
        let evidence = self.evidence_path.as_deref().unwrap_or(&self.path);
        Ok(Some(vec![
            ip.to_string(),
            port.to_string(),
            self.id(),
            self.user.clone(),
            self.password.clone(),
            self.name.clone(),
            http::join(&base, evidence),
        ]))
    }

    async fn exploit(
        &self,
        record: &VulnerabilityRecord,
        snapshot_dir: &Path,
    ) -> Result<Option<PathBuf>, ScanError> {
        let fail = |reason: String| ScanError::Exploit {
            check: self.id(),
            target: format!("{}:{}", record.ip(), record.port()),
            reason,
        };
        // The evidence URL is the field dropped from the persisted line.
        let Some(url) = record.fields().get(6) else {
            return Ok(None);
        };

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fail(e.to_string()))?;
        let ext = extension_for(
            resp.headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
        );
        let body = resp.bytes().await.map_err(|e| fail(e.to_string()))?;

        let file = snapshot_dir.join(snapshot_file_name(record, ext));
        tokio::fs::write(&file, &body).await?;
        Ok(Some(file))
    }
}

/// `<ip>-<port>-<device>-<vulnId>.<ext>`, safe on every filesystem.
pub fn snapshot_file_name(record: &VulnerabilityRecord, ext: &str) -> String {
    let stem: String = format!("{}-{}-{}", record.ip(), record.port(), record.device_vuln_id())
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{stem}.{ext}")
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|c| c.split(';').next().unwrap_or("").trim()) {
        Some("image/jpeg") => "jpg",
        Some("image/png") => "png",
        Some("text/html") => "html",
        Some(c) if c.starts_with("text/") => "txt",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl Poc for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn verify(&self, _ip: IpAddr, _port: u16) -> Result<Option<Vec<String>>, ScanError> {
            Ok(None)
        }
        async fn exploit(
            &self,
            _record: &VulnerabilityRecord,
            _dir: &Path,
        ) -> Result<Option<PathBuf>, ScanError> {
            Ok(None)
        }
    }

    #[test]
    fn lookup_preserves_registration_order() {
        let mut reg = PocRegistry::new();
        reg.register("cam", Arc::new(Named("first")));
        reg.register("cam", Arc::new(Named("second")));
        reg.register("dvr", Arc::new(Named("other")));
        let names: Vec<_> = reg.lookup("cam").iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.products(), 2);
    }

    #[test]
    fn unknown_product_has_no_checks() {
        assert!(PocRegistry::new().lookup("nothing").is_empty());
    }

    #[test]
    fn snapshot_names_are_filesystem_safe() {
        let rec = VulnerabilityRecord::new(["::1", "80", "cam-x/1", "a", "b", "n"]).unwrap();
        assert_eq!(snapshot_file_name(&rec, "jpg"), "__1-80-cam-x_1.jpg");
    }

    #[test]
    fn content_type_maps_to_extension() {
        assert_eq!(extension_for(Some("image/jpeg; charset=binary")), "jpg");
        assert_eq!(extension_for(Some("text/plain")), "txt");
        assert_eq!(extension_for(None), "bin");
    }
}

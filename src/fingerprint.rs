use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use log::debug;
use regex::Regex;

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::http;

/// Identifies the product behind an open port.
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    /// `Ok(None)` when nothing is recognised.
    async fn identify(
        &self,
        ip: IpAddr,
        port: u16,
        config: &ScanConfig,
    ) -> Result<Option<String>, ScanError>;
}

/// A product is recognised when `pattern` matches the response to `path`.
#[derive(Debug, Clone)]
pub struct FingerprintRule {
    pub product: String,
    pub path: String,
    pub pattern: Regex,
}

/// Tries rules in order against the device's web console; first match wins.
pub struct RuleFingerprinter {
    rules: Vec<FingerprintRule>,
    client: reqwest::Client,
}

impl RuleFingerprinter {
    pub fn new(rules: Vec<FingerprintRule>, client: reqwest::Client) -> Self {
        Self { rules, client }
    }

    pub fn rules(&self) -> &[FingerprintRule] {
        &self.rules
    }
}

#[async_trait]
impl Fingerprinter for RuleFingerprinter {
    async fn identify(
        &self,
        ip: IpAddr,
        port: u16,
        _config: &ScanConfig,
    ) -> Result<Option<String>, ScanError> {
        let base = http::base_url(ip, port);
        // Several rules usually share a path; fetch each one once.
        let mut pages: HashMap<&str, Option<String>> = HashMap::new();
        let mut last_err = None;
        let mut fetched_any = false;

        for rule in &self.rules {
            if !pages.contains_key(rule.path.as_str()) {
                let page = match http::fetch_text(&self.client, &http::join(&base, &rule.path)).await
                {
                    Ok(text) => {
                        fetched_any = true;
                        Some(text)
                    }
                    Err(e) => {
                        debug!("{ip}:{port} fetch {} failed: {e}", rule.path);
                        last_err = Some(e);
                        None
                    }
                };
                pages.insert(rule.path.as_str(), page);
            }

            if let Some(Some(text)) = pages.get(rule.path.as_str()) {
                if rule.pattern.is_match(text) {
                    return Ok(Some(rule.product.clone()));
                }
            }
        }

        match last_err {
            Some(e) if !fetched_any => Err(ScanError::Fingerprint {
                ip,
                port,
                reason: e.to_string(),
            }),
            _ => Ok(None),
        }
    }
}

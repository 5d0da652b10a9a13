//! JSON rules file: fingerprint rules plus declarative HTTP checks.
//!
//! ```json
//! {
//!   "fingerprints": [{ "product": "hikvision", "path": "/", "pattern": "(?i)hikvision" }],
//!   "pocs": [{
//!     "product": "hikvision", "device": "hikvision", "vuln_id": "cve-2017-7921",
//!     "name": "cve-2017-7921", "path": "/Security/users?auth=YWRtaW46MTEK",
//!     "pattern": "<UserList", "evidence_path": "/onvif-http/snapshot?auth=YWRtaW46MTEK"
//!   }]
//! }
//! ```
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::fingerprint::{FingerprintRule, RuleFingerprinter};
use crate::poc::{HttpPoc, PocRegistry};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub fingerprints: Vec<FingerprintDef>,
    #[serde(default)]
    pub pocs: Vec<PocDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerprintDef {
    pub product: String,
    #[serde(default = "root_path")]
    pub path: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PocDef {
    pub product: String,
    /// Defaults to `product`.
    #[serde(default)]
    pub device: Option<String>,
    pub vuln_id: String,
    pub name: String,
    pub path: String,
    pub pattern: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub evidence_path: Option<String>,
}

fn root_path() -> String {
    "/".to_string()
}

impl RulesFile {
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid rules file")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read rules file: {}", path.display()))?;
        Self::parse(&content).with_context(|| path.display().to_string())
    }

    pub fn fingerprinter(&self, client: reqwest::Client) -> Result<RuleFingerprinter> {
        let rules = self
            .fingerprints
            .iter()
            .map(|def| {
                Ok(FingerprintRule {
                    product: def.product.clone(),
                    path: def.path.clone(),
                    pattern: compile(&def.pattern)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RuleFingerprinter::new(rules, client))
    }

    pub fn registry(&self, client: reqwest::Client) -> Result<PocRegistry> {
        let mut registry = PocRegistry::new();
        for def in &self.pocs {
            let device = def.device.clone().unwrap_or_else(|| def.product.clone());
            if device.is_empty() || device.contains('-') {
                anyhow::bail!("check {}: device `{device}` must be non-empty and dash-free", def.name);
            }
            let poc = HttpPoc {
                device,
                vuln_id: def.vuln_id.clone(),
                name: def.name.clone(),
                path: def.path.clone(),
                pattern: compile(&def.pattern)?,
                user: def.user.clone(),
                password: def.password.clone(),
                evidence_path: def.evidence_path.clone(),
                client: client.clone(),
            };
            registry.register(def.product.clone(), Arc::new(poc));
        }
        Ok(registry)
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid pattern: {pattern}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const SAMPLE: &str = r#"{
        "fingerprints": [
            { "product": "hikvision", "pattern": "(?i)hikvision" },
            { "product": "dahua", "path": "/baseProj/js/base.js", "pattern": "dahua" }
        ],
        "pocs": [
            { "product": "hikvision", "vuln_id": "cve-2017-7921", "name": "cve-2017-7921",
              "path": "/Security/users", "pattern": "<UserList" },
            { "product": "hikvision", "vuln_id": "weak-pass", "name": "weak password",
              "path": "/ISAPI/Security/userCheck", "pattern": "<statusValue>200", "user": "admin",
              "password": "12345" }
        ]
    }"#;

    fn client() -> reqwest::Client {
        crate::http::build_client(Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn builds_rules_in_file_order() {
        let rules = RulesFile::parse(SAMPLE).unwrap();
        let fp = rules.fingerprinter(client()).unwrap();
        assert_eq!(fp.rules().len(), 2);
        assert_eq!(fp.rules()[0].path, "/");

        let reg = rules.registry(client()).unwrap();
        let names: Vec<_> = reg.lookup("hikvision").iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["cve-2017-7921", "weak password"]);
    }

    #[test]
    fn bad_regex_is_reported() {
        let rules = RulesFile::parse(r#"{"fingerprints":[{"product":"x","pattern":"("}]}"#).unwrap();
        assert!(rules.fingerprinter(client()).is_err());
    }

    #[test]
    fn dashed_device_is_rejected() {
        let rules = RulesFile::parse(
            r#"{"pocs":[{"product":"a-b","vuln_id":"1","name":"n","path":"/","pattern":"x"}]}"#,
        )
        .unwrap();
        assert!(rules.registry(client()).is_err());
    }

    #[test]
    fn empty_file_is_fine() {
        let rules = RulesFile::parse("{}").unwrap();
        assert!(rules.registry(client()).unwrap().is_empty());
    }
}

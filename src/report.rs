use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Widest histogram bar, reached by the most frequent vulnerability.
pub const BAR_WIDTH: usize = 25;
const RULE_WIDTH: usize = 46;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VulnCount {
    pub name: String,
    pub count: usize,
    pub bar: usize,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceGroup {
    pub device: String,
    pub total: usize,
    pub vulns: Vec<VulnCount>,
}

/// Findings grouped by device, then by vulnerability name, in the order
/// they first appear in the log.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Report {
    pub groups: Vec<DeviceGroup>,
    pub total: usize,
    pub max: usize,
}

impl Report {
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = Report::default();
        for line in lines {
            let fields: Vec<&str> = line.as_ref().trim().split(',').collect();
            if fields.len() < 3 {
                continue;
            }
            let device = fields[2].split('-').next().unwrap_or_default();
            let vuln = fields[fields.len() - 1];
            report.add(device, vuln);
        }

        report.max = report
            .groups
            .iter()
            .flat_map(|g| g.vulns.iter().map(|v| v.count))
            .max()
            .unwrap_or(0);
        let max = report.max;
        for v in report.groups.iter_mut().flat_map(|g| g.vulns.iter_mut()) {
            v.bar = scale(v.count, max);
        }
        report
    }

    /// Read the result log. `None` when it is missing or holds no findings.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        let report = Self::from_lines(content.lines());
        Ok((report.total > 0).then_some(report))
    }

    fn add(&mut self, device: &str, vuln: &str) {
        self.total += 1;
        let idx = match self.groups.iter().position(|g| g.device == device) {
            Some(i) => i,
            None => {
                self.groups.push(DeviceGroup {
                    device: device.to_string(),
                    total: 0,
                    vulns: Vec::new(),
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[idx];
        group.total += 1;
        match group.vulns.iter_mut().find(|v| v.name == vuln) {
            Some(v) => v.count += 1,
            None => group.vulns.push(VulnCount { name: vuln.to_string(), count: 1, bar: 0 }),
        }
    }

    /// Terminal histogram.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{} REPORT {}\n", "-".repeat(19), "-".repeat(19)));
        for g in &self.groups {
            out.push_str(&format!("{} {}\n", g.device, g.total));
            for v in &g.vulns {
                out.push_str(&format!("{:>18} | {} {}\n", v.name, "▥".repeat(v.bar), v.count));
            }
        }
        out.push_str(&format!("{:>width$}\n", format!("sum: {}", self.total), width = RULE_WIDTH));
        out.push_str(&"-".repeat(RULE_WIDTH));
        out.push('\n');
        out
    }
}

fn scale(count: usize, max: usize) -> usize {
    if max == 0 {
        return 0;
    }
    (count as f64 / max as f64 * BAR_WIDTH as f64).round() as usize
}

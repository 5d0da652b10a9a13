//! Library crate for vulnscan-rs: a bounded-concurrency vulnerability-scan
//! orchestrator with pluggable probe, fingerprint and check collaborators.
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod http;
pub mod logging;
pub mod orchestrator;
pub mod poc;
pub mod ports;
pub mod probe;
pub mod progress;
pub mod report;
pub mod rules;
pub mod scanner;
pub mod server;
pub mod snapshot;
pub mod status;
pub mod targets;
pub mod types;

pub use config::ScanConfig;
pub use error::ScanError;
pub use orchestrator::{Orchestrator, RunState, RunSummary, StopReason};
pub use targets::TargetFeed;
pub use types::{Target, VulnerabilityRecord};

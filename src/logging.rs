use std::fs;
use std::io::Write;
use std::path::Path;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use log::LevelFilter;

/// Initialise the global logger.
///
/// Level comes from `RUST_LOG` (default `info`); `verbose` forces `debug`.
/// Output goes to stderr, or is appended to `log_file` when given.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|v| v.parse::<LevelFilter>().ok())
            .unwrap_or(LevelFilter::Info)
    };

    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        // Dependencies are chatty at debug.
        .filter_module("hyper", LevelFilter::Warn)
        .filter_module("reqwest", LevelFilter::Warn)
        .filter_module("rustls", LevelFilter::Warn)
        .format(|buf, record| {
            let ts = OffsetDateTime::now_utc()
                .format(&well_known::Rfc3339)
                .unwrap_or_default();
            writeln!(buf, "{} [{}] {} - {}", ts, record.level(), record.target(), record.args())
        });

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("logger already initialised")?;
    log::debug!("log level: {level}");
    Ok(())
}

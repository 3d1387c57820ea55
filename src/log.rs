//! Logging setup.
//!
//! Protocol output owns stdout (or an inherited descriptor), so logs go to stderr
//! or to a file, never into the transport.

use crate::config::LogConfig;
use crate::protocol::trace::WireTracer;
use anyhow::Context;
use env_logger::{Env, Target};
use std::fs::OpenOptions;

/// Install a global logger, return a wire tracer if wire tracing is enabled.
pub fn init(config: &LogConfig) -> anyhow::Result<Option<WireTracer>> {
    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("warn"));
    if let Some(level) = config.level.as_deref() {
        builder.parse_filters(level);
    }

    match config.file.as_deref() {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder.target(Target::Pipe(Box::new(file)));
        }
        None => {
            builder.target(Target::Stderr);
        }
    }
    builder.try_init().context("install logger")?;

    if !config.trace_wire {
        return Ok(None);
    }
    match config.file.as_deref() {
        Some(path) => Ok(Some(WireTracer::new(path)?)),
        None => {
            log::warn!(target: "bridge", "--trace-wire requires --log-file; tracing disabled");
            Ok(None)
        }
    }
}

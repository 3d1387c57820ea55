//! Bridge configuration.
//!
//! Loaded from a TOML file (`~/.config/bs-bridge/config.toml` by default),
//! command line flags override file values.

use crate::session::retry::RetryPolicy;
use anyhow::Context;
use serde::Deserialize;
use std::fs::read_to_string;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub launch: LaunchConfig,
    pub step: StepConfig,
    /// Wait for a stop after an interrupt.
    pub interrupt: RetryPolicy,
    /// Wait for the end of launching or attaching.
    pub attach: RetryPolicy,
    pub notifier: NotifierConfig,
    pub transport: TransportConfig,
    pub log: LogConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            step: StepConfig::default(),
            interrupt: RetryPolicy::new(50, 20),
            attach: RetryPolicy::new(100, 50),
            notifier: NotifierConfig::default(),
            transport: TransportConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfig {
    /// Disable address space layout randomization for launched processes.
    pub disable_aslr: bool,
    /// Keep launched process stopped at its first instruction.
    pub stop_at_entry: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            disable_aslr: true,
            stop_at_entry: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepConfig {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    /// Max step-out attempts while looking for user code.
    pub user_code_max_hops: u32,
}

impl StepConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.poll_interval_ms, self.max_polls)
    }
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_polls: 20,
            user_code_max_hops: 16,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotifierConfig {
    pub poll_interval_ms: u64,
    /// Max bytes of process output in a single notification.
    pub output_chunk: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            output_chunk: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Frames larger than this are treated as a corrupted stream.
    pub max_frame_len: usize,
    /// Largest memory block a single `readMemory` may request.
    pub max_read_len: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 64 * 1024 * 1024,
            max_read_len: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `env_logger` filter directives, `RUST_LOG` is used if not set.
    pub level: Option<String>,
    /// Write logs into this file instead of stderr.
    pub file: Option<PathBuf>,
    /// Trace wire messages into the log file.
    pub trace_wire: bool,
}

impl BridgeConfig {
    const DEFAULT_PATH: &'static str = ".config/bs-bridge/config.toml";

    /// Load configuration.
    /// An explicit `path` must exist, a missing file at the default location means defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let data = read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                Self::from_toml(&data).with_context(|| format!("parse {}", path.display()))
            }
            None => {
                let Some(path) = home::home_dir().map(|home| home.join(Self::DEFAULT_PATH)) else {
                    return Ok(Self::default());
                };
                match read_to_string(&path) {
                    Ok(data) => {
                        Self::from_toml(&data).with_context(|| format!("parse {}", path.display()))
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
                    Err(e) => {
                        Err(e).with_context(|| format!("read config file {}", path.display()))
                    }
                }
            }
        }
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        Ok(toml::de::from_str(data)?)
    }
}

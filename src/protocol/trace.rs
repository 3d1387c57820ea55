use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Direction of a traced message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn marker(self) -> &'static str {
        match self {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        }
    }
}

/// Simple file-based tracer of wire traffic.
#[derive(Clone)]
pub struct WireTracer {
    file: Arc<Mutex<File>>,
}

impl WireTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open trace file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn message(&self, direction: Direction, payload: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{} {}",
                direction.marker(),
                String::from_utf8_lossy(payload)
            );
        }
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }
}

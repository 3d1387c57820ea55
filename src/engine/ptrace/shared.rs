//! State visible to target handles without a tracer thread round trip.

use crate::engine::{EngineError, EngineEvent, ProcessState, StopInfo};
use log::debug;
use os_pipe::{PipeReader, PipeWriter};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Max bytes kept per output stream, oldest bytes are dropped first.
const OUTPUT_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ProcessState,
    pub stop: Option<StopInfo>,
    pub exit: Option<i32>,
    pub pid: Option<u32>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ProcessState::Unloaded,
            stop: None,
            exit: None,
            pid: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Default)]
pub struct Shared {
    snapshot: Mutex<Snapshot>,
    stdout: Mutex<VecDeque<u8>>,
    stderr: Mutex<VecDeque<u8>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    pub fn snapshot(&self) -> Snapshot {
        *lock(&self.snapshot)
    }

    pub fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        f(&mut lock(&self.snapshot))
    }

    fn buffer(&self, stream: Stream) -> &Mutex<VecDeque<u8>> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }

    pub fn push_output(&self, stream: Stream, data: &[u8]) {
        let mut buffer = lock(self.buffer(stream));
        buffer.extend(data);
        let excess = buffer.len().saturating_sub(OUTPUT_BUFFER_LIMIT);
        buffer.drain(..excess);
    }

    /// Take up to `max` buffered bytes.
    pub fn take_output(&self, stream: Stream, max: usize) -> Vec<u8> {
        let mut buffer = lock(self.buffer(stream));
        let n = max.min(buffer.len());
        buffer.drain(..n).collect()
    }
}

/// Read process output in a background thread until the pipe is closed.
pub fn spawn_output_pump(
    reader: PipeReader,
    stream: Stream,
    shared: Arc<Shared>,
    events: Sender<EngineEvent>,
) -> std::io::Result<()> {
    let name = match stream {
        Stream::Stdout => "bs-stdout",
        Stream::Stderr => "bs-stderr",
    };
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut reader = reader;
        let mut buf = [0; 4096];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(target: "tracer", "{stream:?} pump: {e}");
                    break;
                }
            };
            shared.push_output(stream, &buf[..n]);
            let event = match stream {
                Stream::Stdout => EngineEvent::Stdout,
                Stream::Stderr => EngineEvent::Stderr,
            };
            _ = events.send(event);
        }
        debug!(target: "tracer", "{stream:?} closed");
    })?;
    Ok(())
}

/// Process input fed by a background thread, a full pipe never blocks a sender.
pub struct InputPump {
    tx: Sender<Vec<u8>>,
}

impl InputPump {
    /// Queue data for the process input. Return queued bytes count.
    pub fn send(&self, data: &[u8]) -> Result<usize, EngineError> {
        self.tx
            .send(data.to_vec())
            .map_err(|_| EngineError::Failure("process input is closed".to_string()))?;
        Ok(data.len())
    }
}

/// Write queued data into the process input until the pump or the pipe is closed.
pub fn spawn_input_pump(writer: PipeWriter) -> std::io::Result<InputPump> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::Builder::new()
        .name("bs-stdin".to_string())
        .spawn(move || {
            let mut writer = writer;
            for chunk in rx {
                if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
                    debug!(target: "tracer", "stdin pump: {e}");
                    break;
                }
            }
            debug!(target: "tracer", "stdin closed");
        })?;
    Ok(InputPump { tx })
}

//! Event notifier.
//!
//! A dedicated thread that observes engine events of an active target and writes them
//! as unsolicited notifications into the shared [`Outbox`]. The notifier never mutates
//! session state, its only shared resources are the target handle and the outbox.

use crate::config::NotifierConfig;
use crate::engine::{EngineEvent, Module, ProcessState, Target};
use crate::protocol::{
    ModuleImage, ModulesPayload, Notification, OutputPayload, Outbox, StatePayload,
    StoppedPayload,
};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Max output chunks emitted for a single output event.
const MAX_CHUNKS_PER_EVENT: usize = 64;

/// Handle to a running notifier thread, the thread is stopped and joined on drop.
pub struct EventNotifier {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EventNotifier {
    /// Start a notifier thread.
    ///
    /// # Arguments
    ///
    /// * `target`: observed target, used for reading stop details and process output
    /// * `events`: target event receiver
    /// * `outbox`: shared output stream
    /// * `config`: poll interval and output chunk size
    pub fn spawn(
        target: Arc<dyn Target>,
        events: Receiver<EngineEvent>,
        outbox: Outbox,
        config: &NotifierConfig,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            target,
            events,
            outbox,
            interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            output_chunk: config.output_chunk.max(1),
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name("bs-notifier".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Request a stop and wait until the thread finishes.
    /// Events already produced by the engine are delivered before exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "notifier", "notifier thread panicked");
            }
        }
    }
}

impl Drop for EventNotifier {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

struct Worker {
    target: Arc<dyn Target>,
    events: Receiver<EngineEvent>,
    outbox: Outbox,
    interval: Duration,
    output_chunk: usize,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!(target: "notifier", "notifier started");

        while !self.stop.load(Ordering::SeqCst) {
            match self.events.recv_timeout(self.interval) {
                Ok(event) => {
                    if !self.handle(event) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    debug!(target: "notifier", "event source closed");
                    return;
                }
            }
        }

        while let Ok(event) = self.events.try_recv() {
            if !self.handle(event) {
                return;
            }
        }
        debug!(target: "notifier", "notifier stopped");
    }

    /// Handle single event, return `false` if transport is broken.
    fn handle(&self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::StateChanged(state) => self.on_state(state),
            EngineEvent::Stdout => {
                self.on_output(|max| self.target.read_stdout(max), Notification::Stdout)
            }
            EngineEvent::Stderr => {
                self.on_output(|max| self.target.read_stderr(max), Notification::Stderr)
            }
            EngineEvent::ModulesLoaded(modules) => {
                self.emit(&Notification::ModuleLoaded(relocated_images(&modules)))
            }
            EngineEvent::ModulesUnloaded(modules) => {
                self.emit(&Notification::ModuleUnloaded(relocated_images(&modules)))
            }
        }
    }

    fn on_state(&self, state: ProcessState) -> bool {
        let exit_status = if state == ProcessState::Exited {
            self.target.exit_status()
        } else {
            None
        };
        let generic = Notification::State(StatePayload {
            inferior_state: state.code(),
            state_desc: state.into(),
            exit_status,
        });
        if !self.emit(&generic) {
            return false;
        }

        match state {
            ProcessState::Stopped => self.emit(&stopped_notification(self.target.as_ref())),
            ProcessState::Detached => self.emit(&Notification::Detached),
            _ => true,
        }
    }

    fn on_output(
        &self,
        read: impl Fn(usize) -> crate::engine::Result<Vec<u8>>,
        wrap: fn(OutputPayload) -> Notification,
    ) -> bool {
        for _ in 0..MAX_CHUNKS_PER_EVENT {
            let Some(data) = crate::muted_error!(read(self.output_chunk)) else {
                return true;
            };
            if data.is_empty() {
                return true;
            }
            if !self.emit(&wrap(OutputPayload::from_bytes(&data))) {
                return false;
            }
        }
        true
    }

    fn emit(&self, notification: &Notification) -> bool {
        match self.outbox.send(notification) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "notifier", "write notification: {e:#}");
                false
            }
        }
    }
}

/// Build a `stopped` notification from current target stop details.
pub fn stopped_notification(target: &dyn Target) -> Notification {
    let payload = match target.stop_info() {
        Some(stop) => StoppedPayload {
            reason: stop.reason.to_string(),
            thread_id: stop.thread_id,
            pc: stop.pc,
        },
        None => StoppedPayload {
            reason: "Stopped".to_string(),
            thread_id: 0,
            pc: 0,
        },
    };
    Notification::Stopped(payload)
}

/// Images that not relocated yet (load address below file address) are omitted.
fn relocated_images(modules: &[Module]) -> ModulesPayload {
    let modules = modules
        .iter()
        .filter_map(|module| {
            let slide = module.slide()?;
            Some(ModuleImage {
                directory: module.directory().map(ToString::to_string),
                file: module.file_name().map(ToString::to_string),
                load_address: module.load_address,
                file_address: module.file_address,
                slide,
            })
        })
        .collect();
    ModulesPayload { modules }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::{Arch, DebugEngine, LaunchInfo};
    use crate::protocol::writer::tests::MemorySink;
    use crate::protocol::Framing;
    use serde_json::json;
    use std::path::{Path, PathBuf};

    fn config() -> NotifierConfig {
        NotifierConfig {
            poll_interval_ms: 5,
            output_chunk: 4,
        }
    }

    fn stop_at_entry() -> LaunchInfo {
        LaunchInfo {
            stop_at_entry: true,
            ..LaunchInfo::default()
        }
    }

    fn module(path: &str, load: u64, file: u64) -> Module {
        Module {
            path: PathBuf::from(path),
            uuid: None,
            load_address: load,
            file_address: file,
            size: 0x1000,
            sections: vec![],
        }
    }

    #[test]
    fn test_state_and_stop_notifications() {
        let engine = MockEngine::new();
        let target = engine
            .create_target(Some(Path::new("/bin/mock")), Arch::X86_64)
            .unwrap();
        let events = target.subscribe().unwrap();
        let sink = MemorySink::default();
        let outbox = Outbox::new(sink.clone(), Framing::Binary);

        let notifier = EventNotifier::spawn(target.clone(), events, outbox, &config()).unwrap();
        target.launch(&stop_at_entry()).unwrap();
        notifier.shutdown();

        let docs = sink.documents(Framing::Binary);
        assert!(docs.iter().all(|d| d.get("status").is_none()));
        let stopped: Vec<_> = docs.iter().filter(|d| d["type"] == "stopped").collect();
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0]["payload"]["reason"], json!("Exec"));
        assert_eq!(stopped[0]["payload"]["pc"], json!(MockEngine::ENTRY));
        assert!(docs
            .iter()
            .any(|d| d["type"] == "state" && d["payload"]["state_desc"] == "eStateStopped"));
    }

    #[test]
    fn test_output_chunked_and_hex_encoded() {
        let engine = MockEngine::new();
        let target = engine
            .create_target(Some(Path::new("/bin/mock")), Arch::X86_64)
            .unwrap();
        let events = target.subscribe().unwrap();
        let sink = MemorySink::default();
        let outbox = Outbox::new(sink.clone(), Framing::Binary);

        let notifier = EventNotifier::spawn(target.clone(), events, outbox, &config()).unwrap();
        engine.mock_target().push_stdout(b"hello\n");
        notifier.shutdown();

        let outputs: Vec<_> = sink
            .documents(Framing::Binary)
            .into_iter()
            .filter(|d| d["type"] == "stdout")
            .map(|d| d["payload"]["output"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(outputs, vec!["68656c6c".to_string(), "6f0a".to_string()]);
    }

    #[test]
    fn test_detach_and_exit() {
        let engine = MockEngine::new();
        let target = engine
            .create_target(Some(Path::new("/bin/mock")), Arch::X86_64)
            .unwrap();
        let events = target.subscribe().unwrap();
        let sink = MemorySink::default();
        let outbox = Outbox::new(sink.clone(), Framing::Line);

        let notifier = EventNotifier::spawn(target.clone(), events, outbox, &config()).unwrap();
        target.launch(&stop_at_entry()).unwrap();
        engine.mock_target().exit(3);
        target.detach().unwrap_err();
        notifier.shutdown();

        let docs = sink.documents(Framing::Line);
        let exited = docs
            .iter()
            .find(|d| d["type"] == "state" && d["payload"]["inferior_state"] == 10)
            .unwrap();
        assert_eq!(exited["payload"]["exit_status"], json!(3));
        assert!(docs.iter().all(|d| d["type"] != "detached"));
    }

    #[test]
    fn test_detached_notification() {
        let engine = MockEngine::new();
        let target = engine
            .create_target(Some(Path::new("/bin/mock")), Arch::X86_64)
            .unwrap();
        let events = target.subscribe().unwrap();
        let sink = MemorySink::default();
        let outbox = Outbox::new(sink.clone(), Framing::Binary);

        let notifier = EventNotifier::spawn(target.clone(), events, outbox, &config()).unwrap();
        target.launch(&stop_at_entry()).unwrap();
        target.detach().unwrap();
        notifier.shutdown();

        let docs = sink.documents(Framing::Binary);
        assert_eq!(docs.last().unwrap(), &json!({"type": "detached"}));
    }

    #[test]
    fn test_not_relocated_modules_omitted() {
        let payload = relocated_images(&[
            module("/usr/lib/libc.so.6", 0x7fff_0000, 0),
            module("/opt/weird.so", 0x1000, 0x2000),
        ]);
        assert_eq!(payload.modules.len(), 1);
        assert_eq!(payload.modules[0].file.as_deref(), Some("libc.so.6"));
        assert_eq!(payload.modules[0].directory.as_deref(), Some("/usr/lib"));
        assert_eq!(payload.modules[0].slide, 0x7fff_0000);
    }
}

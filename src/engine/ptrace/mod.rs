//! Linux x86_64 debug engine on top of ptrace.
//!
//! Every ptrace request must come from the thread that attached a tracee, so each target
//! owns a dedicated tracer thread. Target handles send closures to this thread through
//! [`exchanger`] and wait for the result. Between requests the thread polls tracee
//! statuses, so process stops are reported even if nobody asks.

pub mod breakpoint;
pub mod console;
pub mod disasm;
pub mod exchanger;
pub mod memory;
pub mod modules;
pub mod process;
pub mod register;
pub mod shared;
pub mod tracer;
pub mod unwind;

use crate::engine::ptrace::console::Console;
use crate::engine::ptrace::exchanger::{exchanger, ClientExchanger, Request, ServerExchanger};
use crate::engine::ptrace::shared::{Shared, Stream};
use crate::engine::ptrace::tracer::Tracer;
use crate::engine::{
    Arch, BreakpointInfo, Capabilities, CommandContext, CommandOutput, DebugEngine, EngineError,
    EngineEvent, Frame, Instruction, LaunchInfo, Module, ProcessState, Register, Result,
    StepKind, StopInfo, Target, ThreadInfo,
};
use crate::weak_error;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tracer thread wakes up at least this often to poll tracee statuses.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Default)]
pub struct PtraceEngine {
    console: Console,
}

impl PtraceEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DebugEngine for PtraceEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            remote_connect: false,
            raw_commands: true,
            reference_scan: true,
        }
    }

    fn create_target(&self, executable: Option<&Path>, arch: Arch) -> Result<Arc<dyn Target>> {
        if arch != Arch::X86_64 {
            return Err(EngineError::Unsupported("32-bit targets"));
        }
        let executable = executable.map(resolve_program).transpose()?;
        let target = PtraceTarget::spawn(executable)?;
        Ok(Arc::new(target))
    }

    fn execute_command(&self, ctx: CommandContext, line: &str) -> CommandOutput {
        self.console.execute(ctx, line)
    }

    fn complete_command(&self, line: &str, pos: usize) -> Vec<String> {
        self.console.complete(line, pos)
    }
}

/// Return a path to an executable file, bare program names are looked up in `PATH`.
fn resolve_program(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.components().count() == 1 {
        if let Ok(found) = which::which(path) {
            return Ok(found);
        }
    }
    Err(EngineError::ExecutableNotFound(path.display().to_string()))
}

fn tracer_loop(server: ServerExchanger, mut tracer: Tracer) {
    loop {
        match server.next_request(POLL_INTERVAL) {
            Ok(Some(Request::Task(task))) => task(&mut tracer),
            Ok(Some(Request::Exit)) | Err(_) => break,
            Ok(None) => {}
        }
        tracer.poll();
    }
    weak_error!(tracer.destroy(), "destroy on tracer exit:");
    debug!(target: "tracer", "tracer thread exit");
}

pub struct PtraceTarget {
    client: ClientExchanger,
    shared: Arc<Shared>,
    events: Mutex<Option<Receiver<EngineEvent>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PtraceTarget {
    fn spawn(executable: Option<PathBuf>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let (events_tx, events_rx): (Sender<EngineEvent>, _) = mpsc::channel();
        let (server, client) = exchanger();
        let (init_tx, init_rx) = mpsc::sync_channel(1);

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("bs-tracer".to_string())
            .spawn(move || {
                // disassembler is bound to the thread, so tracer is created in place
                match Tracer::new(thread_shared, events_tx, executable) {
                    Ok(tracer) => {
                        _ = init_tx.send(Ok(()));
                        tracer_loop(server, tracer);
                    }
                    Err(e) => {
                        _ = init_tx.send(Err(e));
                    }
                }
            })?;

        init_rx.recv().map_err(|_| EngineError::TracerGone)??;
        info!(target: "tracer", "tracer thread started");

        Ok(Self {
            client,
            shared,
            events: Mutex::new(Some(events_rx)),
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl Drop for PtraceTarget {
    fn drop(&mut self) {
        self.client.send_exit();
        let handle = self.handle.lock().ok().and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!(target: "tracer", "tracer thread panicked");
            }
        }
    }
}

impl Target for PtraceTarget {
    fn subscribe(&self) -> Option<Receiver<EngineEvent>> {
        self.events.lock().ok()?.take()
    }

    fn executable(&self) -> Option<PathBuf> {
        self.client.request_sync(|t| t.executable()).ok().flatten()
    }

    fn launch(&self, info: &LaunchInfo) -> Result<()> {
        let info = info.clone();
        self.client.request_sync(move |t| t.launch(&info))?
    }

    fn attach(&self, pid: u32) -> Result<()> {
        self.client.request_sync(move |t| t.attach(pid))?
    }

    fn process_id(&self) -> Option<u32> {
        self.shared.snapshot().pid
    }

    fn state(&self) -> ProcessState {
        self.shared.snapshot().state
    }

    fn stop_info(&self) -> Option<StopInfo> {
        self.shared.snapshot().stop
    }

    fn exit_status(&self) -> Option<i32> {
        self.shared.snapshot().exit
    }

    fn resume(&self) -> Result<()> {
        self.client.request_sync(|t| t.resume())?
    }

    fn interrupt(&self) -> Result<()> {
        self.client.request_sync(|t| t.interrupt())?
    }

    fn kill(&self) -> Result<()> {
        self.client.request_sync(|t| t.kill())?
    }

    fn detach(&self) -> Result<()> {
        self.client.request_sync(|t| t.detach())?
    }

    fn destroy(&self) -> Result<()> {
        self.client.request_sync(|t| t.destroy())?
    }

    fn step(&self, tid: u64, kind: StepKind) -> Result<()> {
        self.client.request_sync(move |t| t.step(tid, kind))?
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        self.client.request_sync(|t| t.threads())?
    }

    fn set_breakpoint(&self, addr: u64) -> Result<BreakpointInfo> {
        self.client.request_sync(move |t| t.set_breakpoint(addr))?
    }

    fn remove_breakpoint(&self, id: u32) -> Result<()> {
        self.client.request_sync(move |t| t.remove_breakpoint(id))?
    }

    fn remove_all_breakpoints(&self) -> Result<()> {
        self.client.request_sync(|t| t.remove_all_breakpoints())?
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.client.request_sync(move |t| t.read_memory(addr, len))?
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.client
            .request_sync(move |t| t.write_memory(addr, &data))?
    }

    fn registers(&self, tid: u64, frame: usize) -> Result<Vec<Register>> {
        self.client.request_sync(move |t| t.registers(tid, frame))?
    }

    fn set_register(&self, tid: u64, frame: usize, name: &str, value: u64) -> Result<()> {
        let name = name.to_string();
        self.client
            .request_sync(move |t| t.set_register(tid, frame, &name, value))?
    }

    fn call_stack(&self, tid: u64) -> Result<Vec<Frame>> {
        self.client.request_sync(move |t| t.call_stack(tid))?
    }

    fn disassemble(&self, addr: u64, count: usize) -> Result<Vec<Instruction>> {
        self.client.request_sync(move |t| t.disassemble(addr, count))?
    }

    fn modules(&self) -> Result<Vec<Module>> {
        self.client.request_sync(|t| t.modules())?
    }

    fn main_module(&self) -> Result<Option<Module>> {
        self.client.request_sync(|t| t.main_module())?
    }

    fn entry_point(&self) -> Result<u64> {
        self.client.request_sync(|t| t.entry_point())?
    }

    fn find_references(&self, addr: u64) -> Result<Vec<Instruction>> {
        self.client.request_sync(move |t| t.find_references(addr))?
    }

    fn write_stdin(&self, data: &[u8]) -> Result<usize> {
        let data = data.to_vec();
        self.client.request_sync(move |t| t.write_stdin(&data))?
    }

    fn read_stdout(&self, max: usize) -> Result<Vec<u8>> {
        Ok(self.shared.take_output(Stream::Stdout, max))
    }

    fn read_stderr(&self, max: usize) -> Result<Vec<u8>> {
        Ok(self.shared.take_output(Stream::Stderr, max))
    }
}

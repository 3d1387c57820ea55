//! Debug session: lifecycle state machine over a single engine target.
//!
//! ```text
//! Uninitialized --prepare--> Prepared --launch/attach/connect--> Active
//!       ^                                                          |
//!       +------------------- detach / deleteProcess ---------------+
//! ```
//!
//! Only the dispatch loop mutates a session. Process sub-state (running, stopped, exited)
//! is never cached here, the engine target is asked every time.

pub mod error;
pub mod retry;

pub use error::{Error, ErrorKind};

use crate::config::BridgeConfig;
use crate::engine::{
    Arch, Capabilities, CommandContext, DebugEngine, EngineError, EngineEvent, Instruction,
    LaunchInfo, Module, StepKind, Target,
};
use crate::notifier::{stopped_notification, EventNotifier};
use crate::protocol::{Notification, Outbox, Response, StoppedPayload};
use crate::weak_error;
use error::EngineResultExt;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Executable staged for a launch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executable {
    pub path: PathBuf,
    pub is_64: bool,
    pub cwd: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Observable lifecycle state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Prepared,
    Active,
}

/// Breakpoint known by a session. Breakpoints created before a process exists are
/// pending and installed into the engine when the session becomes active.
#[derive(Clone, Debug)]
struct BreakpointEntry {
    address: u64,
    engine_id: Option<u32>,
}

#[derive(Default)]
struct BreakpointRegistry {
    last_id: u32,
    entries: BTreeMap<u32, BreakpointEntry>,
}

impl BreakpointRegistry {
    fn add(&mut self, address: u64, engine_id: Option<u32>) -> u32 {
        self.last_id += 1;
        self.entries.insert(
            self.last_id,
            BreakpointEntry {
                address,
                engine_id,
            },
        );
        self.last_id
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct ActiveTarget {
    target: Arc<dyn Target>,
    notifier: Option<EventNotifier>,
    selected_thread: Option<u64>,
    selected_frame: usize,
}

impl ActiveTarget {
    /// Forget thread and frame focus, next stop decides it.
    fn reset_focus(&mut self) {
        self.selected_thread = None;
        self.selected_frame = 0;
    }
}

enum Lifecycle {
    Uninitialized,
    Prepared(Executable),
    Active(ActiveTarget),
}

/// Result of a bounded step.
struct StepOutcome {
    thread_id: u64,
    pc: u64,
    completed: bool,
}

pub struct Session {
    engine: Arc<dyn DebugEngine>,
    capabilities: Capabilities,
    config: BridgeConfig,
    outbox: Outbox,
    lifecycle: Lifecycle,
    last_prepared: Option<Executable>,
    breakpoints: BreakpointRegistry,
}

impl Session {
    /// Create a session in `Uninitialized` state. Engine capabilities are resolved here, once.
    pub fn new(engine: Arc<dyn DebugEngine>, config: BridgeConfig, outbox: Outbox) -> Self {
        let capabilities = engine.capabilities();
        debug!(target: "session", "engine capabilities: {capabilities:?}");
        Self {
            engine,
            capabilities,
            config,
            outbox,
            lifecycle: Lifecycle::Uninitialized,
            last_prepared: None,
            breakpoints: BreakpointRegistry::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self.lifecycle {
            Lifecycle::Uninitialized => SessionState::Uninitialized,
            Lifecycle::Prepared(_) => SessionState::Prepared,
            Lifecycle::Active(_) => SessionState::Active,
        }
    }

    fn active(&self) -> Result<&ActiveTarget, Error> {
        match &self.lifecycle {
            Lifecycle::Active(active) => Ok(active),
            _ => Err(Error::NoProcess),
        }
    }

    fn active_mut(&mut self) -> Result<&mut ActiveTarget, Error> {
        match &mut self.lifecycle {
            Lifecycle::Active(active) => Ok(active),
            _ => Err(Error::NoProcess),
        }
    }

    fn target(&self) -> Result<Arc<dyn Target>, Error> {
        Ok(self.active()?.target.clone())
    }

    // --------------------------------- lifecycle -------------------------------------------------

    /// Stage an executable for a later launch. No engine calls.
    pub fn prepare(&mut self, executable: Executable) -> Result<Response, Error> {
        if let Lifecycle::Active(_) = self.lifecycle {
            return Err(Error::AlreadyExists);
        }
        info!(target: "session", "prepare executable {}", executable.path.display());
        self.last_prepared = Some(executable.clone());
        self.lifecycle = Lifecycle::Prepared(executable);
        Ok(Response::ok())
    }

    /// Create a target from a prepared executable and start a process.
    pub fn launch(&mut self) -> Result<Response, Error> {
        let executable = match &self.lifecycle {
            Lifecycle::Active(_) => return Err(Error::AlreadyExists),
            Lifecycle::Prepared(exe) => exe.clone(),
            Lifecycle::Uninitialized => self.last_prepared.clone().ok_or(Error::NotPrepared)?,
        };

        let target = self
            .engine
            .create_target(Some(&executable.path), Arch::from_is64(executable.is_64))
            .map_err(Error::TargetCreationFailed)?;
        let events = target
            .subscribe()
            .ok_or_else(|| Error::Internal("target events already taken".to_string()))?;

        let launch_info = LaunchInfo {
            args: executable.args.clone(),
            cwd: executable.cwd.clone(),
            disable_aslr: self.config.launch.disable_aslr,
            // pending breakpoints need a stopped process, resumed later if configured so
            stop_at_entry: true,
        };
        if let Err(e) = target.launch(&launch_info) {
            weak_error!(target.destroy(), "discard target:");
            return Err(Error::LaunchFailed(e));
        }
        self.config
            .attach
            .poll(|| !target.state().is_transitional());

        let notifier = self
            .start_notifier(&target, events)
            .map_err(Error::LaunchFailed)?;
        self.activate(target.clone(), notifier);

        if !self.config.launch.stop_at_entry {
            if let Err(e) = target.resume() {
                weak_error!(self.delete_process(), "discard launched process:");
                return Err(Error::LaunchFailed(e));
            }
        }

        info!(target: "session", "process launched, pid: {:?}", target.process_id());
        Ok(Response::ok().with("pid", target.process_id()))
    }

    /// Create a target and attach it to a running process.
    pub fn attach(
        &mut self,
        pid: u32,
        executable: Option<PathBuf>,
        is_64: bool,
    ) -> Result<Response, Error> {
        if let Lifecycle::Active(_) = self.lifecycle {
            return Err(Error::AlreadyExists);
        }

        let target = self
            .engine
            .create_target(executable.as_deref(), Arch::from_is64(is_64))
            .map_err(Error::TargetCreationFailed)?;
        let events = target
            .subscribe()
            .ok_or_else(|| Error::Internal("target events already taken".to_string()))?;

        if let Err(e) = target.attach(pid) {
            weak_error!(target.destroy(), "discard target:");
            return Err(Error::AttachFailed(e));
        }
        if !self
            .config
            .attach
            .poll(|| !target.state().is_transitional())
            .is_ready()
        {
            warn!(target: "session", "process {pid} still attaching, continue anyway");
        }

        let notifier = self
            .start_notifier(&target, events)
            .map_err(Error::AttachFailed)?;
        self.activate(target.clone(), notifier);
        info!(target: "session", "attached to process {pid}");

        let mut response = Response::ok().with("pid", pid);
        if let Some(Some(main)) = weak_error!(target.main_module()) {
            response = with_slide(response, &main);
        }
        Ok(response)
    }

    /// Connect to a remote debug server through the engine.
    pub fn connect_remote(
        &mut self,
        is_64: bool,
        url: &str,
        plugin: &str,
        file: Option<PathBuf>,
    ) -> Result<Response, Error> {
        if let Lifecycle::Active(_) = self.lifecycle {
            return Err(Error::AlreadyExists);
        }
        if !self.capabilities.remote_connect {
            return Err(Error::Unsupported("remote connection"));
        }

        let target = self
            .engine
            .create_target(file.as_deref(), Arch::from_is64(is_64))
            .map_err(Error::TargetCreationFailed)?;
        let events = target
            .subscribe()
            .ok_or_else(|| Error::Internal("target events already taken".to_string()))?;

        if let Err(e) = target.connect_remote(url, plugin) {
            weak_error!(target.destroy(), "discard target:");
            return Err(Error::ConnectFailed(e));
        }
        self.config
            .attach
            .poll(|| !target.state().is_transitional());

        let notifier = self
            .start_notifier(&target, events)
            .map_err(Error::ConnectFailed)?;
        self.activate(target, notifier);
        Ok(Response::ok())
    }

    fn start_notifier(
        &self,
        target: &Arc<dyn Target>,
        events: Receiver<EngineEvent>,
    ) -> Result<EventNotifier, EngineError> {
        EventNotifier::spawn(
            target.clone(),
            events,
            self.outbox.clone(),
            &self.config.notifier,
        )
        .map_err(|e| {
            weak_error!(target.destroy(), "discard target:");
            EngineError::IO(e)
        })
    }

    /// Switch into `Active` and install pending breakpoints.
    fn activate(&mut self, target: Arc<dyn Target>, notifier: EventNotifier) {
        for (id, entry) in self.breakpoints.entries.iter_mut() {
            if entry.engine_id.is_some() {
                continue;
            }
            if let Some(bp) = weak_error!(
                target.set_breakpoint(entry.address),
                "install pending breakpoint:"
            ) {
                debug!(target: "session", "breakpoint {id} installed at 0x{:x}", bp.load_address);
                entry.engine_id = Some(bp.id);
            }
        }

        self.lifecycle = Lifecycle::Active(ActiveTarget {
            target,
            notifier: Some(notifier),
            selected_thread: None,
            selected_frame: 0,
        });
    }

    /// Detach from a process, session returns to `Uninitialized`.
    pub fn detach(&mut self) -> Result<Response, Error> {
        let target = self.target()?;
        target.detach().op("detach")?;
        if let Lifecycle::Active(mut active) =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Uninitialized)
        {
            if let Some(notifier) = active.notifier.take() {
                notifier.shutdown();
            }
        }
        self.breakpoints.clear();
        info!(target: "session", "detached");
        Ok(Response::ok())
    }

    /// Stop the notifier, destroy a process and release the target.
    pub fn delete_process(&mut self) -> Result<Response, Error> {
        self.active()?;
        if let Lifecycle::Active(mut active) =
            std::mem::replace(&mut self.lifecycle, Lifecycle::Uninitialized)
        {
            if let Some(notifier) = active.notifier.take() {
                notifier.shutdown();
            }
            weak_error!(active.target.destroy(), "destroy target:");
        }
        self.breakpoints.clear();
        info!(target: "session", "process deleted");
        Ok(Response::ok())
    }

    /// Release everything, used on server exit.
    pub fn shutdown(&mut self) {
        if let Lifecycle::Active(_) = self.lifecycle {
            _ = self.delete_process();
        }
    }

    pub fn has_process(&self) -> Result<Response, Error> {
        self.active()?;
        Ok(Response::ok())
    }

    pub fn process_state(&self) -> Result<Response, Error> {
        let target = self.target()?;
        let state = target.state();
        let mut response = Response::ok()
            .with("state", state.code())
            .with("state-string", <&str>::from(state));
        if let Some(code) = target.exit_status() {
            response = response.with("exit_status", code);
        }
        Ok(response)
    }

    // --------------------------------- execution control -----------------------------------------

    /// Resume a process. Stop is reported later by the notifier.
    pub fn resume(&mut self) -> Result<Response, Error> {
        let active = self.active_mut()?;
        active.target.resume().op("continue")?;
        active.reset_focus();
        Ok(Response::ok())
    }

    /// Asynchronous break, returns immediately.
    pub fn interrupt(&mut self) -> Result<Response, Error> {
        self.target()?.interrupt().op("interrupt")?;
        Ok(Response::ok())
    }

    pub fn kill(&mut self) -> Result<Response, Error> {
        self.target()?.kill().op("kill")?;
        Ok(Response::ok())
    }

    /// Interrupt, wait a bit for a stop and always emit a `stopped` notification.
    pub fn force_stop_and_report(&mut self) -> Result<Response, Error> {
        let target = self.target()?;
        if let Err(e) = target.interrupt() {
            debug!(target: "session", "interrupt before report: {e:#}");
        }
        let outcome = self.config.interrupt.poll(|| {
            let state = target.state();
            state.is_stopped() || state.is_terminal()
        });
        if !outcome.is_ready() {
            warn!(target: "session", "process not stopped, report last known state");
        }
        self.notify(&stopped_notification(target.as_ref()));
        self.active_mut()?.reset_focus();
        Ok(Response::ok())
    }

    fn notify(&self, notification: &Notification) {
        weak_error!(self.outbox.send(notification), "write notification:");
    }

    /// Halt a running process before a step. Return `false` if process is still running.
    fn ensure_stopped(&self, target: &dyn Target) -> bool {
        let state = target.state();
        if !state.is_running() {
            return true;
        }
        weak_error!(target.interrupt(), "interrupt before step:");
        self.config
            .interrupt
            .poll(|| !target.state().is_running())
            .is_ready()
    }

    fn step_inner(&mut self, kind: StepKind) -> Result<StepOutcome, Error> {
        let target = self.target()?;
        if target.state().is_terminal() {
            return Err(Error::NoProcess);
        }

        let halted = self.ensure_stopped(target.as_ref());
        let thread_id = self.current_thread()?;
        let last_pc = target.stop_info().map(|s| s.pc).unwrap_or_default();

        let completed = if halted {
            target.step(thread_id, kind).op("step")?;
            self.config
                .step
                .policy()
                .poll(|| {
                    let state = target.state();
                    state.is_stopped() || state.is_terminal()
                })
                .is_ready()
        } else {
            warn!(target: "session", "process not halted, step is not issued");
            false
        };

        let (thread_id, pc) = match target.stop_info() {
            Some(stop) if completed => (stop.thread_id, stop.pc),
            _ => (thread_id, last_pc),
        };
        if !completed {
            warn!(target: "session", "step not completed in time, last known pc: 0x{pc:x}");
            let reason = target
                .stop_info()
                .map(|s| s.reason.to_string())
                .unwrap_or_else(|| "Trace".to_string());
            self.notify(&Notification::Stopped(StoppedPayload {
                reason,
                thread_id,
                pc,
            }));
        }

        self.active_mut()?.reset_focus();
        Ok(StepOutcome {
            thread_id,
            pc,
            completed,
        })
    }

    /// Bounded step. Never fails because of a timeout, reports the last known pc instead.
    pub fn step(&mut self, kind: StepKind) -> Result<Response, Error> {
        let outcome = self.step_inner(kind)?;
        Ok(Response::ok()
            .with("threadId", outcome.thread_id)
            .with("pc", outcome.pc)
            .with("completed", outcome.completed))
    }

    /// Step out until the program counter is inside the main executable.
    pub fn step_until_user_code(&mut self) -> Result<Response, Error> {
        let target = self.target()?;
        let main = target
            .main_module()
            .op("main module")?
            .ok_or(Error::Engine("main module", EngineError::NoMainModule))?;

        let mut pc = target.stop_info().map(|s| s.pc).unwrap_or_default();
        let mut thread_id = self.current_thread()?;
        let mut hops = 0;
        while !main.contains(pc) && hops < self.config.step.user_code_max_hops {
            let outcome = self.step_inner(StepKind::Out)?;
            hops += 1;
            pc = outcome.pc;
            thread_id = outcome.thread_id;
            if !outcome.completed {
                break;
            }
        }

        Ok(Response::ok()
            .with("reached", main.contains(pc))
            .with("threadId", thread_id)
            .with("pc", pc)
            .with("hops", hops))
    }

    // --------------------------------- threads and frames ----------------------------------------

    /// Selected thread, or a thread of the last stop, or the first one.
    fn current_thread(&self) -> Result<u64, Error> {
        let active = self.active()?;
        if let Some(tid) = active.selected_thread {
            return Ok(tid);
        }
        if let Some(stop) = active.target.stop_info() {
            return Ok(stop.thread_id);
        }
        let threads = active.target.threads().op("threads")?;
        threads
            .first()
            .map(|t| t.tid)
            .ok_or(Error::NoThreadSelected)
    }

    pub fn threads(&self) -> Result<Response, Error> {
        let threads = self.target()?.threads().op("threads")?;
        let list: Vec<Value> = threads
            .iter()
            .map(|t| json!({"thread-id": t.tid, "state": t.stop_reason.to_string()}))
            .collect();
        Ok(Response::ok().with("threads", list))
    }

    pub fn select_thread(&mut self, tid: u64) -> Result<Response, Error> {
        let active = self.active_mut()?;
        let threads = active.target.threads().op("threads")?;
        if !threads.iter().any(|t| t.tid == tid) {
            return Err(Error::NoThread(tid));
        }
        active.selected_thread = Some(tid);
        active.selected_frame = 0;
        Ok(Response::ok())
    }

    pub fn call_stack(&self) -> Result<Response, Error> {
        let tid = self.current_thread()?;
        let frames = self.target()?.call_stack(tid).op("unwind")?;
        let callstack: Vec<Value> = frames
            .iter()
            .map(|f| {
                json!({
                    "pc": f.pc,
                    "function": f.function,
                    "filename": f.module,
                    "uuid": f.uuid,
                })
            })
            .collect();
        Ok(Response::ok().with("callstack", callstack))
    }

    pub fn select_frame(&mut self, index: usize) -> Result<Response, Error> {
        let tid = self.current_thread()?;
        let active = self.active_mut()?;
        let depth = active.target.call_stack(tid).op("unwind")?.len();
        if index >= depth {
            return Err(Error::FrameNotFound(index));
        }
        active.selected_frame = index;
        Ok(Response::ok())
    }

    // --------------------------------- registers and memory --------------------------------------

    pub fn registers(&self) -> Result<Response, Error> {
        let tid = self.current_thread()?;
        let active = self.active()?;
        let registers = active
            .target
            .registers(tid, active.selected_frame)
            .op("read registers")?;
        let map: Map<String, Value> = registers
            .into_iter()
            .map(|r| (r.name, Value::String(format!("0x{:016x}", r.value))))
            .collect();
        Ok(Response::typed("registers", json!({ "registers": map })))
    }

    pub fn set_register(&mut self, name: &str, value: u64) -> Result<Response, Error> {
        let tid = self.current_thread()?;
        let active = self.active()?;
        match active
            .target
            .set_register(tid, active.selected_frame, name, value)
        {
            Ok(()) => Ok(Response::ok()),
            Err(EngineError::RegisterNameNotFound(_)) => Err(Error::RegisterNotFound),
            Err(e) => Err(Error::Engine("cannot set the register value", e)),
        }
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Response, Error> {
        let max = self.config.transport.max_read_len;
        if len > max {
            return Err(Error::BadRequest(format!(
                "readMemory: length {len} is above the limit of {max} bytes"
            )));
        }
        let data = self
            .target()?
            .read_memory(addr, len)
            .op("unable to read memory")?;
        Ok(Response::typed(
            "memory",
            json!({ "lines": memory_lines(addr, &data) }),
        ))
    }

    pub fn write_byte(&mut self, addr: u64, value: u8) -> Result<Response, Error> {
        let written = self
            .target()?
            .write_memory(addr, &[value])
            .op("unable to write process memory")?;
        Ok(Response::ok()
            .with("address", addr)
            .with("value", value)
            .with("written", written))
    }

    pub fn send_to_application(&mut self, data: &[u8]) -> Result<Response, Error> {
        let written = self
            .target()?
            .write_stdin(data)
            .op("cannot send data to application")?;
        Ok(Response::ok().with("written", written))
    }

    // --------------------------------- breakpoints -----------------------------------------------

    /// Target must exist: a pending breakpoint is allowed in `Prepared` state only.
    fn require_target(&self) -> Result<Option<Arc<dyn Target>>, Error> {
        match &self.lifecycle {
            Lifecycle::Uninitialized => Err(Error::NoTarget),
            Lifecycle::Prepared(_) => Ok(None),
            Lifecycle::Active(active) => Ok(Some(active.target.clone())),
        }
    }

    pub fn set_breakpoint(&mut self, addr: u64) -> Result<Response, Error> {
        match self.require_target()? {
            Some(target) => {
                let bp = target
                    .set_breakpoint(addr)
                    .op("cannot create breakpoint")?;
                let id = self.breakpoints.add(addr, Some(bp.id));
                Ok(Response::ok()
                    .with("bkpt_id", id)
                    .with("bl0", format!("load addr: 0x{:x}", bp.load_address)))
            }
            None => {
                let id = self.breakpoints.add(addr, None);
                Ok(Response::ok().with("bkpt_id", id).with("pending", true))
            }
        }
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> Result<Response, Error> {
        let target = self.require_target()?;
        let entry = self
            .breakpoints
            .entries
            .get(&id)
            .cloned()
            .ok_or(Error::Engine(
                "cannot remove breakpoint",
                EngineError::BreakpointNotFound(id),
            ))?;
        if let (Some(target), Some(engine_id)) = (target, entry.engine_id) {
            target
                .remove_breakpoint(engine_id)
                .op("cannot remove breakpoint")?;
        }
        self.breakpoints.entries.remove(&id);
        Ok(Response::ok())
    }

    pub fn remove_all_breakpoints(&mut self) -> Result<Response, Error> {
        if let Some(target) = self.require_target()? {
            target
                .remove_all_breakpoints()
                .op("cannot remove all breakpoints")?;
        }
        self.breakpoints.clear();
        Ok(Response::ok())
    }

    // --------------------------------- code view -------------------------------------------------

    pub fn disassembly(&self, addr: u64, count: usize) -> Result<Response, Error> {
        let target = self.require_target()?.ok_or(Error::NoProcess)?;
        let instructions = target
            .disassemble(addr, count)
            .op("disassembly failed")?;
        Ok(Response::typed(
            "disassembly",
            json!({ "lines": instruction_lines(&instructions) }),
        ))
    }

    pub fn main_executable_disassembly(&self, count: usize) -> Result<Response, Error> {
        let target = self.target()?;
        let entry = target.entry_point().op("entry point")?;
        let instructions = target
            .disassemble(entry, count)
            .op("disassembly failed")?;
        Ok(Response::typed(
            "disassembly",
            json!({ "entryPoint": entry, "lines": instruction_lines(&instructions) }),
        ))
    }

    pub fn find_string_references(&self, addr: u64) -> Result<Response, Error> {
        let target = self.target()?;
        if !self.capabilities.reference_scan {
            return Err(Error::Unsupported("reference scanning"));
        }
        let references = target.find_references(addr).op("reference scan")?;
        Ok(Response::typed(
            "references",
            json!({ "stringAddress": addr, "references": instruction_lines(&references) }),
        ))
    }

    // --------------------------------- modules ---------------------------------------------------

    pub fn module_count(&self) -> Result<Response, Error> {
        let modules = self.target()?.modules().op("modules")?;
        Ok(Response::ok().with("count", modules.len()))
    }

    pub fn module_at_index(&self, index: i64) -> Result<Response, Error> {
        let modules = self.target()?.modules().op("modules")?;
        let module = usize::try_from(index)
            .ok()
            .and_then(|i| modules.get(i))
            .ok_or(Error::IndexOutOfRange)?;
        Ok(Response::ok().with("module", module_desc(module)))
    }

    pub fn module_for_file(&self, file: &str) -> Result<Response, Error> {
        let modules = self.target()?.modules().op("modules")?;
        let module = modules
            .iter()
            .find(|m| m.matches_file(file))
            .ok_or(Error::ModuleNotFound)?;
        Ok(Response::ok().with("module", module_desc(module)))
    }

    // --------------------------------- raw engine commands ---------------------------------------

    pub fn execute_command(&self, line: &str) -> Result<Response, Error> {
        let active = self.active()?;
        if !self.capabilities.raw_commands {
            return Err(Error::Unsupported("raw engine commands"));
        }
        let ctx = CommandContext {
            target: Some(active.target.as_ref()),
            thread: self.current_thread().ok(),
            frame: active.selected_frame,
        };
        let result = self.engine.execute_command(ctx, line);
        Ok(Response::ok()
            .with("output", result.output)
            .with("error", result.error)
            .with("succeeded", result.succeeded))
    }

    pub fn complete_command(&self, line: &str, pos: usize) -> Result<Response, Error> {
        self.active()?;
        if !self.capabilities.raw_commands {
            return Err(Error::Unsupported("raw engine commands"));
        }
        let completions = self.engine.complete_command(line, pos);
        Ok(Response::ok().with("completions", completions))
    }
}

/// Report where the main executable code is loaded, when it's resolvable.
fn with_slide(response: Response, main: &Module) -> Response {
    let section = main
        .sections
        .iter()
        .find(|s| s.name == ".text" && s.load_address.is_some())
        .or_else(|| main.sections.iter().find(|s| s.load_address.is_some()));
    let Some(section) = section else {
        return response;
    };
    let Some(load) = section.load_address else {
        return response;
    };
    let Some(slide) = load.checked_sub(section.file_address) else {
        return response;
    };
    response
        .with("sectionName", &section.name)
        .with("fileAddr", section.file_address)
        .with("loadAddr", load)
        .with("aslrSlide", slide)
}

fn module_desc(module: &Module) -> Value {
    let sections: Vec<Value> = module
        .sections
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "fileAddr": s.file_address,
                "loadAddr": s.load_address,
                "byteSize": s.byte_size,
                "fileByteSize": s.file_byte_size,
            })
        })
        .collect();
    json!({
        "uuid": module.uuid,
        "filename": module.file_name(),
        "path": module.path.to_string_lossy(),
        "loadAddress": module.load_address,
        "slide": module.slide(),
        "sections": sections,
    })
}

/// Rows of 16 bytes with hex and ascii views.
fn memory_lines(base: u64, data: &[u8]) -> Vec<Value> {
    data.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes = chunk
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if (32..127).contains(&b) {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            json!({
                "address": format!("0x{:016x}", base + (i as u64) * 16),
                "bytes": bytes,
                "ascii": ascii,
            })
        })
        .collect()
}

fn instruction_lines(instructions: &[Instruction]) -> Vec<Value> {
    instructions
        .iter()
        .map(|insn| {
            json!({
                "address": insn.address,
                "bytes": insn.bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" "),
                "instruction": insn.mnemonic,
                "operands": insn.operands,
            })
        })
        .collect()
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

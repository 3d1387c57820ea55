//! Tracer state. Lives in the tracer thread, every ptrace and waitpid call is made from here.
//!
//! Execution model is all-stop: when one thread stops, all other threads are stopped with
//! `SIGSTOP` before the stop is reported. Each `SIGSTOP` sent by the tracer is counted,
//! so late deliveries are recognized and swallowed.

use crate::engine::ptrace::breakpoint::BreakpointRegistry;
use crate::engine::ptrace::disasm::{Disassembler, InsnKind, MAX_INSN_LEN};
use crate::engine::ptrace::memory;
use crate::engine::ptrace::modules::{text_sections, ModuleRegistry};
use crate::engine::ptrace::process;
use crate::engine::ptrace::register::{self as reg, RegisterMap};
use crate::engine::ptrace::shared::{InputPump, Shared, Snapshot};
use crate::engine::ptrace::unwind::{unwind, FrameLayout, FrameRegs};
use crate::engine::{
    BreakpointInfo, EngineError, EngineEvent, Frame, Instruction, LaunchInfo, Module,
    ProcessState, Register, StepKind, StopInfo, StopReason, ThreadInfo,
};
use crate::weak_error;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// List of signals that dont interrupt debugging process and send
/// to debugee directly on fire.
static QUIET_SIGNALS: [Signal; 6] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
];

/// Process breakpoint
const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
const TRAP_TRACE: i32 = 0x2;
/// Sent by the kernel from somewhere
const SI_KERNEL: i32 = 0x80;

/// Upper bound for a single disassembly read.
const MAX_DISASM_READ: usize = 64 * 1024;

#[derive(Debug, Default, Clone, Copy)]
struct Thread {
    running: bool,
    /// Signal to deliver at the next resume.
    pending_signal: Option<Signal>,
}

/// Run-to-address plan of step over and step out.
#[derive(Debug, Clone, Copy)]
struct StepPlan {
    tid: Pid,
    addr: u64,
    /// Plan is complete when the stack pointer is above this value.
    sp_above: u64,
}

struct Process {
    pid: Pid,
    /// Launched by the tracer, otherwise attached.
    launched: bool,
    exe: Option<PathBuf>,
    threads: BTreeMap<Pid, Thread>,
    stdin: Option<InputPump>,
    /// Count of `SIGSTOP` sent by the tracer and not observed yet.
    expected_sigstops: HashMap<Pid, u32>,
    interrupt_requested: bool,
    plan: Option<StepPlan>,
}

impl Process {
    fn new(pid: Pid, launched: bool, threads: impl IntoIterator<Item = Pid>) -> Self {
        Self {
            pid,
            launched,
            exe: fs::read_link(format!("/proc/{pid}/exe")).ok(),
            threads: threads
                .into_iter()
                .map(|tid| (tid, Thread::default()))
                .collect(),
            stdin: None,
            expected_sigstops: HashMap::new(),
            interrupt_requested: false,
            plan: None,
        }
    }

    fn running_threads(&self) -> Vec<Pid> {
        self.threads
            .iter()
            .filter(|(_, t)| t.running)
            .map(|(tid, _)| *tid)
            .collect()
    }

    fn is_running(&self) -> bool {
        self.threads.values().any(|t| t.running)
    }
}

#[derive(Debug, Clone, Copy)]
struct Stop {
    tid: Pid,
    reason: StopReason,
}

/// Cause of a `SIGTRAP`.
enum Trap {
    Breakpoint(u64),
    Step,
    /// int3 that is not a known breakpoint.
    Int3,
    Signal,
}

fn tgkill(pid: Pid, tid: Pid, signal: Signal) -> nix::Result<()> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            pid.as_raw(),
            tid.as_raw(),
            signal as libc::c_int,
        )
    };
    Errno::result(res).map(drop)
}

fn is_fault(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE
    )
}

fn signal_stop_reason(signal: Signal) -> StopReason {
    if is_fault(signal) {
        StopReason::Exception
    } else {
        StopReason::Signal
    }
}

/// Upper bound of step restarts caused by tracer `SIGSTOP`s and ptrace events.
const MAX_STEP_RESTARTS: u32 = 16;

/// Outcome of a single instruction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepped {
    Done,
    /// Thread stopped by a signal, the instruction may not be executed.
    Signal(Signal),
    Gone,
}

pub struct Tracer {
    shared: Arc<Shared>,
    events: Sender<EngineEvent>,
    executable: Option<PathBuf>,
    disasm: Disassembler,
    modules: ModuleRegistry,
    breakpoints: BreakpointRegistry,
    process: Option<Process>,
}

impl Tracer {
    pub fn new(
        shared: Arc<Shared>,
        events: Sender<EngineEvent>,
        executable: Option<PathBuf>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            shared,
            events,
            executable,
            disasm: Disassembler::new()?,
            modules: ModuleRegistry::default(),
            breakpoints: BreakpointRegistry::default(),
            process: None,
        })
    }

    pub fn executable(&self) -> Option<PathBuf> {
        self.executable.clone()
    }

    // ------------------------------------ state -------------------------------------------------

    fn set_state(&self, state: ProcessState) {
        debug!(target: "tracer", "state: {state}");
        self.shared.update(|snapshot| snapshot.state = state);
        _ = self.events.send(EngineEvent::StateChanged(state));
    }

    fn process(&self) -> Result<&Process, EngineError> {
        self.process.as_ref().ok_or(EngineError::ProcessNotStarted)
    }

    fn process_mut(&mut self) -> Result<&mut Process, EngineError> {
        self.process.as_mut().ok_or(EngineError::ProcessNotStarted)
    }

    fn ensure_stopped(&self) -> Result<&Process, EngineError> {
        let process = self.process()?;
        if process.is_running() {
            return Err(EngineError::ProcessRunning);
        }
        Ok(process)
    }

    /// Return a stopped thread for memory access, main thread is preferred.
    fn memory_pid(&self) -> Result<Pid, EngineError> {
        let process = self.process()?;
        if process.threads.get(&process.pid).is_some_and(|t| !t.running) {
            return Ok(process.pid);
        }
        process
            .threads
            .iter()
            .find(|(_, t)| !t.running)
            .map(|(tid, _)| *tid)
            .ok_or(EngineError::ProcessRunning)
    }

    fn thread_pid(&self, tid: u64) -> Result<Pid, EngineError> {
        let process = self.ensure_stopped()?;
        let pid = Pid::from_raw(tid as libc::pid_t);
        if !process.threads.contains_key(&pid) {
            return Err(EngineError::ThreadNotFound(tid));
        }
        Ok(pid)
    }

    fn mark_stopped(&mut self, tid: Pid) {
        if let Some(thread) = self
            .process
            .as_mut()
            .and_then(|p| p.threads.get_mut(&tid))
        {
            thread.running = false;
        }
    }

    fn set_pending_signal(&mut self, tid: Pid, signal: Signal) {
        if let Some(thread) = self
            .process
            .as_mut()
            .and_then(|p| p.threads.get_mut(&tid))
        {
            thread.pending_signal = Some(signal);
        }
    }

    /// Return `true` if a `SIGSTOP` was sent by the tracer.
    fn consume_sigstop(&mut self, tid: Pid) -> bool {
        let Some(process) = self.process.as_mut() else {
            return false;
        };
        match process.expected_sigstops.get_mut(&tid) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Report a stop. All running threads are stopped first, active step plan is dropped.
    fn report_stop(&mut self, stop: Stop) -> Result<(), EngineError> {
        self.stop_all()?;
        if self.process.is_none() {
            return Ok(());
        }
        self.cancel_plan();
        if let Some(process) = self.process.as_mut() {
            process.interrupt_requested = false;
        }

        let pc = weak_error!(RegisterMap::current(stop.tid), "read pc:")
            .map(|regs| regs.value(reg::Register::Rip))
            .unwrap_or_default();
        debug!(target: "tracer", "stop: {stop:?} at 0x{pc:x}");
        self.shared.update(|snapshot| {
            snapshot.stop = Some(StopInfo {
                thread_id: stop.tid.as_raw() as u64,
                pc,
                reason: stop.reason,
            })
        });
        self.sync_modules();
        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn on_process_exit(&mut self, status: Option<i32>) {
        debug!(target: "tracer", "process exit with {status:?}");
        self.process = None;
        self.breakpoints = BreakpointRegistry::default();
        self.modules.clear();
        self.shared.update(|snapshot| {
            snapshot.stop = None;
            snapshot.exit = status;
        });
        self.set_state(ProcessState::Exited);
    }

    fn on_thread_gone(&mut self, tid: Pid, status: Option<i32>) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        process.threads.remove(&tid);
        process.expected_sigstops.remove(&tid);
        if tid == process.pid {
            self.on_process_exit(status);
        }
    }

    fn sync_modules(&mut self) {
        let Some(process) = self.process.as_ref() else {
            return;
        };
        let pid = process.pid;
        let exe = process.exe.clone();
        match self.modules.refresh(pid, exe.as_deref()) {
            Ok((loaded, unloaded)) => {
                if !unloaded.is_empty() {
                    _ = self.events.send(EngineEvent::ModulesUnloaded(unloaded));
                }
                if !loaded.is_empty() {
                    _ = self.events.send(EngineEvent::ModulesLoaded(loaded));
                }
            }
            Err(e) => warn!(target: "tracer", "read process maps: {e:#}"),
        }
    }

    // ------------------------------------ process lifecycle -------------------------------------

    pub fn launch(&mut self, info: &LaunchInfo) -> Result<(), EngineError> {
        if self.process.is_some() {
            return Err(EngineError::AlreadyRun);
        }
        let program = self
            .executable
            .clone()
            .ok_or_else(|| EngineError::ExecutableNotFound("executable is not set".to_string()))?;

        self.shared.update(|snapshot| *snapshot = Snapshot::default());
        self.set_state(ProcessState::Launching);
        let launched = match process::launch(&program, info, &self.shared, &self.events) {
            Ok(launched) => launched,
            Err(e) => {
                self.set_state(ProcessState::Unloaded);
                return Err(e);
            }
        };

        let pid = launched.pid;
        let mut process = Process::new(pid, true, [pid]);
        process.stdin = Some(launched.stdin);
        self.process = Some(process);
        self.breakpoints = BreakpointRegistry::default();
        self.modules.clear();
        self.shared
            .update(|snapshot| snapshot.pid = Some(pid.as_raw() as u32));

        self.report_stop(Stop {
            tid: pid,
            reason: StopReason::Exec,
        })?;
        if !info.stop_at_entry {
            self.resume()?;
        }
        Ok(())
    }

    pub fn attach(&mut self, pid: u32) -> Result<(), EngineError> {
        if self.process.is_some() {
            return Err(EngineError::AlreadyRun);
        }

        self.shared.update(|snapshot| *snapshot = Snapshot::default());
        self.set_state(ProcessState::Attaching);
        let attached = match process::attach(pid) {
            Ok(attached) => attached,
            Err(e) => {
                self.set_state(ProcessState::Unloaded);
                return Err(e);
            }
        };
        if self.executable.is_none() {
            self.executable = attached.executable.clone();
        }

        let main = Pid::from_raw(pid as libc::pid_t);
        let mut process = Process::new(main, false, attached.threads);
        for (tid, signal) in attached.pending {
            // attach SIGSTOP is still queued behind this signal
            *process.expected_sigstops.entry(tid).or_default() += 1;
            if let Some(thread) = process.threads.get_mut(&tid) {
                thread.pending_signal = Some(signal);
            }
        }
        self.process = Some(process);
        self.breakpoints = BreakpointRegistry::default();
        self.modules.clear();
        self.shared.update(|snapshot| snapshot.pid = Some(pid));

        self.report_stop(Stop {
            tid: main,
            reason: StopReason::Signal,
        })
    }

    pub fn resume(&mut self) -> Result<(), EngineError> {
        self.ensure_stopped()?;
        self.resume_with_state(ProcessState::Running)
    }

    fn resume_with_state(&mut self, state: ProcessState) -> Result<(), EngineError> {
        // only the thread that reported a stop steps over its breakpoint,
        // other threads were rewound while stopping and must hit it again
        let stopped_at = self
            .shared
            .snapshot()
            .stop
            .map(|stop| Pid::from_raw(stop.thread_id as libc::pid_t));
        if let Some(tid) = stopped_at {
            if self.at_breakpoint(tid) {
                if let Stepped::Signal(signal) = self.step_thread(tid)? {
                    return self.report_stop(Stop {
                        tid,
                        reason: signal_stop_reason(signal),
                    });
                }
            }
            if self.process.is_none() {
                return Ok(());
            }
        }

        self.set_state(state);
        let tids: Vec<Pid> = self.process()?.threads.keys().copied().collect();
        for tid in tids {
            self.cont_thread(tid)?;
        }
        Ok(())
    }

    fn cont_thread(&mut self, tid: Pid) -> Result<(), EngineError> {
        let Some(thread) = self
            .process
            .as_mut()
            .and_then(|p| p.threads.get_mut(&tid))
        else {
            return Ok(());
        };
        let signal = thread.pending_signal.take();
        match sys::ptrace::cont(tid, signal) {
            Ok(()) => {
                thread.running = true;
                Ok(())
            }
            // thread is exiting, exit status will be received later
            Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(EngineError::Ptrace(e)),
        }
    }

    pub fn interrupt(&mut self) -> Result<(), EngineError> {
        let process = self.process()?;
        let running = process.running_threads();
        let Some(&target) = running
            .iter()
            .find(|&&tid| tid == process.pid)
            .or(running.first())
        else {
            return Ok(());
        };
        let pid = process.pid;

        tgkill(pid, target, Signal::SIGSTOP).map_err(|e| EngineError::Syscall("tgkill", e))?;
        let process = self.process_mut()?;
        *process.expected_sigstops.entry(target).or_default() += 1;
        process.interrupt_requested = true;
        Ok(())
    }

    pub fn kill(&mut self) -> Result<(), EngineError> {
        let pid = self.process()?.pid;
        sys::signal::kill(pid, Signal::SIGKILL).map_err(|e| EngineError::Syscall("kill", e))?;

        let status = loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(tid, code)) if tid == pid => break code,
                Ok(WaitStatus::Signaled(tid, signal, _)) if tid == pid => break signal as i32,
                Ok(WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_EXIT)) => {
                    _ = sys::ptrace::cont(tid, None);
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => break Signal::SIGKILL as i32,
                Err(e) => return Err(EngineError::Waitpid(e)),
            }
        };
        self.on_process_exit(Some(status));
        Ok(())
    }

    pub fn detach(&mut self) -> Result<(), EngineError> {
        self.process()?;
        self.stop_all()?;
        if self.process.is_none() {
            return Ok(());
        }
        self.cancel_plan();
        let mem_pid = self.memory_pid()?;
        self.breakpoints
            .disable_all(mem_pid)
            .map_err(EngineError::Ptrace)?;
        self.drain_sigstops()?;

        if let Some(process) = self.process.take() {
            let mut errors = vec![];
            for (tid, thread) in process.threads {
                match sys::ptrace::detach(tid, thread.pending_signal) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => errors.push(EngineError::Ptrace(e)),
                }
            }
            if !errors.is_empty() {
                warn!(target: "tracer", "detach: {}", EngineError::MultipleErrors(errors));
            }
        }
        self.modules.clear();
        self.shared.update(|snapshot| snapshot.stop = None);
        self.set_state(ProcessState::Detached);
        Ok(())
    }

    /// Deliver `SIGSTOP`s sent by the tracer before detaching,
    /// otherwise they will stop a detached process.
    fn drain_sigstops(&mut self) -> Result<(), EngineError> {
        let pending: Vec<Pid> = self
            .process()?
            .expected_sigstops
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in pending {
            for _ in 0..3 {
                let expected = self
                    .process
                    .as_ref()
                    .and_then(|p| p.expected_sigstops.get(&tid))
                    .copied()
                    .unwrap_or_default();
                if expected == 0 {
                    break;
                }
                self.cont_thread(tid)?;
                self.wait_for_stop(tid)?;
            }
        }
        Ok(())
    }

    /// Kill a launched process or detach from an attached one.
    pub fn destroy(&mut self) -> Result<(), EngineError> {
        let Some(process) = self.process.as_ref() else {
            return Ok(());
        };
        if process.launched {
            self.kill()
        } else {
            self.detach()
        }
    }

    // ------------------------------------ all-stop ----------------------------------------------

    fn stop_all(&mut self) -> Result<(), EngineError> {
        let Some(process) = self.process.as_ref() else {
            return Ok(());
        };
        for tid in process.running_threads() {
            self.stop_thread(tid)?;
            if self.process.is_none() {
                break;
            }
        }
        Ok(())
    }

    fn stop_thread(&mut self, tid: Pid) -> Result<(), EngineError> {
        let pid = self.process()?.pid;
        match tgkill(pid, tid, Signal::SIGSTOP) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                self.on_thread_gone(tid, None);
                return Ok(());
            }
            Err(e) => return Err(EngineError::Syscall("tgkill", e)),
        }
        *self
            .process_mut()?
            .expected_sigstops
            .entry(tid)
            .or_default() += 1;
        self.wait_for_stop(tid)
    }

    /// Wait until a thread stops for any reason. Breakpoint hits are rewound, so they are
    /// hit again after resume, signals are kept for delivery.
    fn wait_for_stop(&mut self, tid: Pid) -> Result<(), EngineError> {
        loop {
            let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    self.on_thread_gone(tid, None);
                    return Ok(());
                }
                Err(e) => return Err(EngineError::Waitpid(e)),
            };
            debug!(target: "tracer", "wait for stop {tid}: {status:?}");

            match status {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                    if !self.consume_sigstop(tid) {
                        debug!(target: "tracer", "external SIGSTOP at {tid} suppressed");
                    }
                }
                WaitStatus::Stopped(_, Signal::SIGTRAP) => match self.classify_trap(tid)? {
                    Trap::Breakpoint(addr) => self.set_pc(tid, addr)?,
                    Trap::Step | Trap::Int3 => {}
                    Trap::Signal => self.set_pending_signal(tid, Signal::SIGTRAP),
                },
                WaitStatus::Stopped(_, signal) => self.set_pending_signal(tid, signal),
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                    self.on_clone(tid)?;
                }
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
                    _ = sys::ptrace::cont(tid, None);
                    continue;
                }
                WaitStatus::PtraceEvent(..) => {}
                WaitStatus::Exited(_, code) => {
                    self.on_thread_gone(tid, Some(code));
                    return Ok(());
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.on_thread_gone(tid, Some(signal as i32));
                    return Ok(());
                }
                _ => continue,
            }
            self.mark_stopped(tid);
            return Ok(());
        }
    }

    /// Register a new thread, the new thread stays stopped.
    fn on_clone(&mut self, tid: Pid) -> Result<Pid, EngineError> {
        let new_tid = Pid::from_raw(
            sys::ptrace::getevent(tid).map_err(EngineError::Ptrace)? as libc::pid_t,
        );
        debug!(target: "tracer", "new thread {new_tid}");

        // initial stop may be already consumed by a `waitpid(-1)`
        let known = self.process()?.threads.contains_key(&new_tid);
        if !known {
            loop {
                match waitpid(new_tid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::Stopped(_, _)) | Ok(WaitStatus::PtraceEvent(..)) => break,
                    Ok(_) => continue,
                    Err(e) => return Err(EngineError::Waitpid(e)),
                }
            }
            self.process_mut()?
                .threads
                .insert(new_tid, Thread::default());
        }
        self.mark_stopped(tid);
        Ok(new_tid)
    }

    // ------------------------------------ async events ------------------------------------------

    /// Handle all available wait statuses without blocking.
    pub fn poll(&mut self) {
        while self.process.is_some() {
            let status = match waitpid(
                Pid::from_raw(-1),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(WaitStatus::StillAlive) => return,
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    self.on_process_exit(None);
                    return;
                }
                Err(e) => {
                    warn!(target: "tracer", "waitpid: {e}");
                    return;
                }
            };
            if let Err(e) = self.handle_status(status) {
                warn!(target: "tracer", "handle {status:?}: {e:#}");
            }
        }
    }

    fn handle_status(&mut self, status: WaitStatus) -> Result<(), EngineError> {
        debug!(target: "tracer", "new status: {status:?}");
        match status {
            WaitStatus::Exited(tid, code) => {
                self.on_thread_gone(tid, Some(code));
                Ok(())
            }
            WaitStatus::Signaled(tid, signal, _) => {
                self.on_thread_gone(tid, Some(signal as i32));
                Ok(())
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_CLONE) => {
                let new_tid = self.on_clone(tid)?;
                self.cont_thread(tid)?;
                self.cont_thread(new_tid)
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_EXIT) => {
                self.mark_stopped(tid);
                self.cont_thread(tid)
            }
            WaitStatus::PtraceEvent(tid, _, libc::PTRACE_EVENT_EXEC) => self.on_exec(tid),
            WaitStatus::PtraceEvent(tid, _, _) => {
                self.mark_stopped(tid);
                self.cont_thread(tid)
            }
            WaitStatus::Stopped(tid, Signal::SIGSTOP) => {
                let known = self
                    .process
                    .as_ref()
                    .is_some_and(|p| p.threads.contains_key(&tid));
                if !known {
                    // a new thread, reported before the clone event of its parent
                    self.process_mut()?.threads.insert(tid, Thread::default());
                    return Ok(());
                }

                self.mark_stopped(tid);
                let interrupt = self.process()?.interrupt_requested;
                if self.consume_sigstop(tid) && !interrupt {
                    // late delivery of a SIGSTOP sent while stopping all threads
                    return self.cont_thread(tid);
                }
                self.report_stop(Stop {
                    tid,
                    reason: StopReason::Signal,
                })
            }
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                self.mark_stopped(tid);
                match self.classify_trap(tid)? {
                    Trap::Breakpoint(addr) => self.on_breakpoint(tid, addr),
                    Trap::Step => self.report_stop(Stop {
                        tid,
                        reason: StopReason::Trace,
                    }),
                    Trap::Int3 => self.report_stop(Stop {
                        tid,
                        reason: StopReason::Signal,
                    }),
                    Trap::Signal => {
                        self.set_pending_signal(tid, Signal::SIGTRAP);
                        self.report_stop(Stop {
                            tid,
                            reason: StopReason::Signal,
                        })
                    }
                }
            }
            WaitStatus::Stopped(tid, signal) if QUIET_SIGNALS.contains(&signal) => {
                self.mark_stopped(tid);
                self.set_pending_signal(tid, signal);
                self.cont_thread(tid)
            }
            WaitStatus::Stopped(tid, signal) => {
                self.mark_stopped(tid);
                self.set_pending_signal(tid, signal);
                self.report_stop(Stop {
                    tid,
                    reason: signal_stop_reason(signal),
                })
            }
            _ => Ok(()),
        }
    }

    /// Process image is replaced, other threads are gone and old patches too.
    fn on_exec(&mut self, tid: Pid) -> Result<(), EngineError> {
        let process = self.process_mut()?;
        let pid = process.pid;
        process.threads.retain(|&t, _| t == pid || t == tid);
        process.threads.entry(pid).or_default();
        process.expected_sigstops.clear();
        process.plan = None;
        process.exe = fs::read_link(format!("/proc/{pid}/exe")).ok();
        self.breakpoints = BreakpointRegistry::default();
        self.mark_stopped(pid);
        self.report_stop(Stop {
            tid: pid,
            reason: StopReason::Exec,
        })
    }

    fn classify_trap(&self, tid: Pid) -> Result<Trap, EngineError> {
        let info = match sys::ptrace::getsiginfo(tid) {
            Ok(info) => info,
            Err(Errno::ESRCH) => return Ok(Trap::Signal),
            Err(e) => return Err(EngineError::Ptrace(e)),
        };
        match info.si_code {
            TRAP_BRKPT | SI_KERNEL => {
                let pc = RegisterMap::current(tid)
                    .map_err(EngineError::Ptrace)?
                    .value(reg::Register::Rip);
                let addr = pc.wrapping_sub(1);
                if self
                    .breakpoints
                    .get(addr)
                    .is_some_and(|brkpt| brkpt.is_enabled())
                {
                    Ok(Trap::Breakpoint(addr))
                } else {
                    Ok(Trap::Int3)
                }
            }
            TRAP_TRACE => Ok(Trap::Step),
            _ => Ok(Trap::Signal),
        }
    }

    fn on_breakpoint(&mut self, tid: Pid, addr: u64) -> Result<(), EngineError> {
        self.set_pc(tid, addr)?;

        if let Some(plan) = self.process()?.plan {
            if plan.addr == addr && plan.tid == tid {
                let sp = RegisterMap::current(tid)
                    .map_err(EngineError::Ptrace)?
                    .value(reg::Register::Rsp);
                if sp > plan.sp_above {
                    return self.report_stop(Stop {
                        tid,
                        reason: StopReason::PlanComplete,
                    });
                }
            }
        }

        if self.breakpoints.get(addr).is_some_and(|b| b.is_user()) {
            return self.report_stop(Stop {
                tid,
                reason: StopReason::Breakpoint,
            });
        }

        // step plan breakpoint reached by another thread or by a recursive call
        match self.step_thread(tid)? {
            Stepped::Done => self.cont_thread(tid),
            Stepped::Signal(signal) => self.report_stop(Stop {
                tid,
                reason: signal_stop_reason(signal),
            }),
            Stepped::Gone => Ok(()),
        }
    }

    fn set_pc(&self, tid: Pid, pc: u64) -> Result<(), EngineError> {
        let mut regs = RegisterMap::current(tid).map_err(EngineError::Ptrace)?;
        regs.update(reg::Register::Rip, pc);
        regs.persist(tid).map_err(EngineError::Ptrace)
    }

    fn pc(&self, tid: Pid) -> Result<u64, EngineError> {
        Ok(RegisterMap::current(tid)
            .map_err(EngineError::Ptrace)?
            .value(reg::Register::Rip))
    }

    // ------------------------------------ stepping ----------------------------------------------

    fn at_breakpoint(&self, tid: Pid) -> bool {
        let Ok(pc) = self.pc(tid) else {
            return false;
        };
        self.breakpoints
            .get(pc)
            .is_some_and(|brkpt| brkpt.is_enabled())
    }

    /// Execute one instruction of a thread, breakpoint at current pc is stepped over.
    fn step_thread(&mut self, tid: Pid) -> Result<Stepped, EngineError> {
        let pc = self.pc(tid)?;
        let patched = self
            .breakpoints
            .get(pc)
            .is_some_and(|brkpt| brkpt.is_enabled());
        if !patched {
            return self.single_step(tid);
        }

        if let Some(brkpt) = self.breakpoints.get_mut(pc) {
            brkpt.disable(tid).map_err(EngineError::Ptrace)?;
        }
        let stepped = self.single_step(tid)?;
        if self.process.is_some() {
            let mem_pid = self.memory_pid()?;
            if let Some(brkpt) = self.breakpoints.get_mut(pc) {
                brkpt.enable(mem_pid).map_err(EngineError::Ptrace)?;
            }
        }
        Ok(stepped)
    }

    /// Single step a thread, a pending signal is delivered with the step.
    /// A new signal ends the step and stays pending.
    fn single_step(&mut self, tid: Pid) -> Result<Stepped, EngineError> {
        let mut restarts = 0;
        'step: loop {
            if restarts > MAX_STEP_RESTARTS {
                return Err(EngineError::StepNotCompleted(restarts));
            }
            restarts += 1;

            let signal = self
                .process
                .as_mut()
                .and_then(|p| p.threads.get_mut(&tid))
                .and_then(|thread| thread.pending_signal.take());
            match sys::ptrace::step(tid, signal) {
                Ok(()) => {}
                Err(Errno::ESRCH) => return Ok(Stepped::Gone),
                Err(e) => return Err(EngineError::Ptrace(e)),
            }

            loop {
                let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                    Ok(status) => status,
                    Err(Errno::ECHILD) => {
                        self.on_thread_gone(tid, None);
                        return Ok(Stepped::Gone);
                    }
                    Err(e) => return Err(EngineError::Waitpid(e)),
                };
                match status {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => return Ok(Stepped::Done),
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {
                        if self.consume_sigstop(tid) {
                            continue 'step;
                        }
                        return Ok(Stepped::Signal(Signal::SIGSTOP));
                    }
                    WaitStatus::Stopped(_, signal) if QUIET_SIGNALS.contains(&signal) => {
                        self.set_pending_signal(tid, signal);
                        continue 'step;
                    }
                    WaitStatus::Stopped(_, signal) => {
                        self.set_pending_signal(tid, signal);
                        return Ok(Stepped::Signal(signal));
                    }
                    WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_CLONE) => {
                        self.on_clone(tid)?;
                        continue 'step;
                    }
                    WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_EXIT) => {
                        _ = sys::ptrace::cont(tid, None);
                    }
                    WaitStatus::PtraceEvent(..) => continue 'step,
                    WaitStatus::Exited(_, code) => {
                        self.on_thread_gone(tid, Some(code));
                        return Ok(Stepped::Gone);
                    }
                    WaitStatus::Signaled(_, signal, _) => {
                        self.on_thread_gone(tid, Some(signal as i32));
                        return Ok(Stepped::Gone);
                    }
                    _ => {}
                }
            }
        }
    }

    pub fn step(&mut self, tid: u64, kind: StepKind) -> Result<(), EngineError> {
        let tid = self.thread_pid(tid)?;
        match kind {
            StepKind::Instruction => self.step_instruction(tid, StopReason::Trace),
            StepKind::Over => {
                let pc = self.pc(tid)?;
                let code = self.read_code(pc, MAX_INSN_LEN)?;
                match self.disasm.classify(&code, pc)? {
                    (InsnKind::Call, len) => {
                        let sp = RegisterMap::current(tid)
                            .map_err(EngineError::Ptrace)?
                            .value(reg::Register::Rsp);
                        // after return stack pointer is the same as before call
                        self.run_plan(tid, pc.wrapping_add(len as u64), sp.saturating_sub(1))
                    }
                    _ => self.step_instruction(tid, StopReason::PlanComplete),
                }
            }
            StepKind::Out => {
                let top = self.frame_regs(tid)?;
                let layout = self.frame_layout(top.pc);
                let caller = layout
                    .caller(top, &|addr| self.read_word(addr))
                    .ok_or(EngineError::ReturnAddressNotFound)?;
                self.run_plan(tid, caller.pc, top.sp)
            }
        }
    }

    fn step_instruction(&mut self, tid: Pid, reason: StopReason) -> Result<(), EngineError> {
        self.set_state(ProcessState::Stepping);
        let stepped = self.step_thread(tid)?;
        let Some(process) = self.process.as_ref() else {
            return Ok(());
        };
        let stop = match stepped {
            Stepped::Done => Stop { tid, reason },
            Stepped::Signal(signal) => Stop {
                tid,
                reason: signal_stop_reason(signal),
            },
            Stepped::Gone => Stop {
                tid: process.pid,
                reason: StopReason::ThreadExiting,
            },
        };
        self.report_stop(stop)
    }

    fn run_plan(&mut self, tid: Pid, addr: u64, sp_above: u64) -> Result<(), EngineError> {
        let mem_pid = self.memory_pid()?;
        self.breakpoints
            .add_internal(mem_pid, addr)
            .map_err(|_| EngineError::MemoryAccess(addr))?;
        self.process_mut()?.plan = Some(StepPlan { tid, addr, sp_above });
        debug!(target: "tracer", "run to 0x{addr:x} at {tid}");
        self.resume_with_state(ProcessState::Stepping)
    }

    fn cancel_plan(&mut self) {
        let Some(plan) = self.process.as_mut().and_then(|p| p.plan.take()) else {
            return;
        };
        if let Ok(mem_pid) = self.memory_pid() {
            weak_error!(
                self.breakpoints.remove_internal(mem_pid, plan.addr),
                "remove step breakpoint:"
            );
        }
    }

    // ------------------------------------ stack -------------------------------------------------

    fn read_word(&self, addr: u64) -> Option<u64> {
        let pid = self.memory_pid().ok()?;
        let data = memory::read_memory_by_pid(pid, addr, 8).ok()?;
        Some(u64::from_ne_bytes(data.try_into().ok()?))
    }

    fn frame_regs(&self, tid: Pid) -> Result<FrameRegs, EngineError> {
        let regs = RegisterMap::current(tid).map_err(EngineError::Ptrace)?;
        Ok(FrameRegs {
            pc: regs.value(reg::Register::Rip),
            sp: regs.value(reg::Register::Rsp),
            bp: regs.value(reg::Register::Rbp),
        })
    }

    fn frame_layout(&mut self, pc: u64) -> FrameLayout {
        let kind = self
            .read_code(pc, MAX_INSN_LEN)
            .and_then(|code| self.disasm.classify(&code, pc))
            .map(|(kind, _)| kind)
            .unwrap_or(InsnKind::Other);
        match kind {
            InsnKind::PushRbp | InsnKind::Ret => FrameLayout::Entry,
            InsnKind::MovRbpRsp => FrameLayout::BpPushed,
            _ if self
                .modules
                .symbolize(pc)
                .is_some_and(|(_, start)| start == pc) =>
            {
                FrameLayout::Entry
            }
            _ => FrameLayout::Established,
        }
    }

    fn unwind_thread(&mut self, tid: Pid) -> Result<Vec<FrameRegs>, EngineError> {
        let top = self.frame_regs(tid)?;
        let layout = self.frame_layout(top.pc);
        Ok(unwind(top, layout, |addr| self.read_word(addr)))
    }

    pub fn call_stack(&mut self, tid: u64) -> Result<Vec<Frame>, EngineError> {
        let tid = self.thread_pid(tid)?;
        if self.modules.modules().is_empty() {
            self.sync_modules();
        }
        let frames = self.unwind_thread(tid)?;

        Ok(frames
            .into_iter()
            .enumerate()
            .map(|(num, frame)| {
                // return address may point right after the end of a function
                let lookup_pc = if num == 0 { frame.pc } else { frame.pc - 1 };
                let function = self.modules.symbolize(lookup_pc).map(|(name, _)| name);
                let module = self.modules.module_at(frame.pc);
                Frame {
                    pc: frame.pc,
                    function,
                    module: module.and_then(|m| m.file_name()).map(ToString::to_string),
                    uuid: module.and_then(|m| m.uuid.clone()),
                }
            })
            .collect())
    }

    // ------------------------------------ threads and registers ---------------------------------

    pub fn threads(&self) -> Result<Vec<ThreadInfo>, EngineError> {
        let process = self.process()?;
        let stop = self.shared.snapshot().stop;
        Ok(process
            .threads
            .keys()
            .map(|tid| {
                let tid = tid.as_raw() as u64;
                let stop_reason = match stop {
                    Some(stop) if stop.thread_id == tid => stop.reason,
                    _ => StopReason::None,
                };
                ThreadInfo { tid, stop_reason }
            })
            .collect())
    }

    pub fn registers(&mut self, tid: u64, frame: usize) -> Result<Vec<Register>, EngineError> {
        let tid = self.thread_pid(tid)?;
        let mut regs = RegisterMap::current(tid).map_err(EngineError::Ptrace)?;
        if frame > 0 {
            let frames = self.unwind_thread(tid)?;
            let frame_regs = frames.get(frame).ok_or(EngineError::FrameNotFound(frame))?;
            regs.update(reg::Register::Rip, frame_regs.pc);
            regs.update(reg::Register::Rsp, frame_regs.sp);
            regs.update(reg::Register::Rbp, frame_regs.bp);
        }
        Ok(regs
            .iter()
            .map(|(register, value)| Register {
                name: register.to_string(),
                value,
            })
            .collect())
    }

    pub fn set_register(
        &mut self,
        tid: u64,
        frame: usize,
        name: &str,
        value: u64,
    ) -> Result<(), EngineError> {
        let tid = self.thread_pid(tid)?;
        if frame != 0 {
            return Err(EngineError::Unsupported("register write in outer frames"));
        }
        let register = reg::Register::from_str(name)
            .map_err(|_| EngineError::RegisterNameNotFound(name.to_string()))?;
        let mut regs = RegisterMap::current(tid).map_err(EngineError::Ptrace)?;
        regs.update(register, value);
        regs.persist(tid).map_err(EngineError::Ptrace)
    }

    // ------------------------------------ breakpoints -------------------------------------------

    /// Run `f` with all threads stopped, threads are resumed after.
    fn with_all_stopped<T>(
        &mut self,
        f: impl FnOnce(&mut Self, Pid) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let was_running = self.process()?.is_running();
        if was_running {
            self.stop_all()?;
        }
        let pid = self.memory_pid()?;
        let result = f(self, pid);
        if was_running {
            let tids: Vec<Pid> = self.process()?.threads.keys().copied().collect();
            for tid in tids {
                self.cont_thread(tid)?;
            }
        }
        result
    }

    pub fn set_breakpoint(&mut self, addr: u64) -> Result<BreakpointInfo, EngineError> {
        self.with_all_stopped(|tracer, pid| {
            tracer
                .breakpoints
                .add_user(pid, addr)
                .map_err(|_| EngineError::MemoryAccess(addr))
        })
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> Result<(), EngineError> {
        self.with_all_stopped(|tracer, pid| {
            if tracer
                .breakpoints
                .remove_user(pid, id)
                .map_err(EngineError::Ptrace)?
            {
                Ok(())
            } else {
                Err(EngineError::BreakpointNotFound(id))
            }
        })
    }

    pub fn remove_all_breakpoints(&mut self) -> Result<(), EngineError> {
        self.with_all_stopped(|tracer, pid| {
            tracer
                .breakpoints
                .remove_all_user(pid)
                .map_err(EngineError::Ptrace)
        })
    }

    // ------------------------------------ memory and code ---------------------------------------

    /// Read up to `len` bytes, int3 patches are masked.
    fn read_code(&self, addr: u64, len: usize) -> Result<Vec<u8>, EngineError> {
        let pid = self.memory_pid()?;
        let mut data = memory::read_available(pid, addr, len);
        if data.is_empty() && len > 0 {
            return Err(EngineError::MemoryAccess(addr));
        }
        self.breakpoints.mask(addr, &mut data);
        Ok(data)
    }

    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, EngineError> {
        self.ensure_stopped()?;
        self.read_code(addr, len)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize, EngineError> {
        self.ensure_stopped()?;
        let pid = self.memory_pid()?;
        self.breakpoints
            .rewrite(pid, addr, data)
            .map_err(|_| EngineError::MemoryAccess(addr))
    }

    pub fn disassemble(&self, addr: u64, count: usize) -> Result<Vec<Instruction>, EngineError> {
        self.ensure_stopped()?;
        if count == 0 {
            return Ok(vec![]);
        }
        let len = count.saturating_mul(MAX_INSN_LEN).min(MAX_DISASM_READ);
        let code = self.read_code(addr, len)?;
        self.disasm.disassemble(&code, addr, count)
    }

    // ------------------------------------ modules -----------------------------------------------

    pub fn modules(&mut self) -> Result<Vec<Module>, EngineError> {
        self.process()?;
        self.sync_modules();
        Ok(self.modules.modules().to_vec())
    }

    pub fn main_module(&mut self) -> Result<Option<Module>, EngineError> {
        let exe = self.process()?.exe.clone();
        self.sync_modules();
        let Some(exe) = exe else {
            return Ok(None);
        };
        Ok(self
            .modules
            .modules()
            .iter()
            .find(|m| m.path == exe)
            .cloned())
    }

    pub fn entry_point(&mut self) -> Result<u64, EngineError> {
        let main = self.main_module()?.ok_or(EngineError::NoMainModule)?;
        let image = self
            .modules
            .image(&main.path)
            .ok_or(EngineError::NoMainModule)?;
        Ok(image.entry + main.slide().unwrap_or_default())
    }

    pub fn find_references(&mut self, addr: u64) -> Result<Vec<Instruction>, EngineError> {
        let main = self.main_module()?.ok_or(EngineError::NoMainModule)?;
        let slide = main.slide().unwrap_or_default();
        let path = main.path.clone();
        self.disasm.find_references(
            main.path,
            slide,
            || {
                Ok(text_sections(&path)?
                    .into_iter()
                    .map(|(file_addr, code)| (file_addr + slide, code))
                    .collect())
            },
            addr,
        )
    }

    // ------------------------------------ process io --------------------------------------------

    pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        self.process()?
            .stdin
            .as_ref()
            .ok_or_else(|| EngineError::Failure("process input is not connected".to_string()))?
            .send(data)
    }
}

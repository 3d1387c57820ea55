//! Scripted in-memory engine, drives session and notifier tests without ptrace.

use crate::engine::{
    Arch, BreakpointInfo, Capabilities, CommandContext, CommandOutput, DebugEngine, EngineError,
    EngineEvent, Frame, Instruction, LaunchInfo, Module, ProcessState, Register, Result, Section,
    StepKind, StopInfo, StopReason, Target, ThreadInfo,
};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Behaviour switches, shared by an engine and all its targets.
#[derive(Default)]
pub struct Knobs {
    pub fail_create: AtomicBool,
    pub fail_launch: AtomicBool,
    /// Steps never complete.
    pub hang_steps: AtomicBool,
    /// Interrupts never stop a running process.
    pub ignore_interrupt: AtomicBool,
    pub panic_on_call_stack: AtomicBool,
    pub fail_resume: AtomicBool,
    /// Process starts outside the main executable.
    pub start_in_library: AtomicBool,
}

pub struct MockEngine {
    pub knobs: Arc<Knobs>,
    targets: Mutex<Vec<Arc<MockTarget>>>,
}

impl MockEngine {
    pub const PID: u32 = 4242;
    pub const MAIN_BASE: u64 = 0x400000;
    pub const MAIN_SIZE: u64 = 0x2000;
    pub const ENTRY: u64 = 0x401000;
    pub const LIBRARY_PC: u64 = 0x7fff_f7a0_1000;
    const COMMANDS: [&'static str; 4] = ["backtrace", "breakpoints", "echo", "registers"];

    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            knobs: Arc::new(Knobs::default()),
            targets: Mutex::new(vec![]),
        })
    }

    /// Last created target.
    pub fn mock_target(&self) -> Arc<MockTarget> {
        self.targets
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no targets")
    }

    pub fn target_count(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    pub fn set(&self, knob: impl Fn(&Knobs) -> &AtomicBool) {
        knob(&self.knobs).store(true, Ordering::SeqCst);
    }
}

impl DebugEngine for MockEngine {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            remote_connect: false,
            raw_commands: true,
            reference_scan: true,
        }
    }

    fn create_target(&self, executable: Option<&Path>, arch: Arch) -> Result<Arc<dyn Target>> {
        if self.knobs.fail_create.load(Ordering::SeqCst) || arch != Arch::X86_64 {
            return Err(EngineError::ExecutableNotFound(format!("{executable:?}")));
        }
        let (tx, rx) = channel();
        let target = Arc::new(MockTarget {
            knobs: self.knobs.clone(),
            executable: executable.map(Path::to_path_buf),
            events_tx: Mutex::new(tx),
            events_rx: Mutex::new(Some(rx)),
            inner: Mutex::new(Inner::new()),
        });
        self.targets.lock().unwrap().push(target.clone());
        Ok(target)
    }

    fn execute_command(&self, ctx: CommandContext, line: &str) -> CommandOutput {
        match line.split_once(' ') {
            Some(("echo", rest)) => CommandOutput::success(rest),
            _ if line == "registers" => match ctx.target {
                Some(target) => {
                    let regs = target
                        .registers(ctx.thread.unwrap_or(0), ctx.frame)
                        .unwrap_or_default();
                    CommandOutput::success(
                        regs.iter()
                            .map(|r| format!("{} 0x{:x}", r.name, r.value))
                            .collect::<Vec<_>>()
                            .join("\n"),
                    )
                }
                None => CommandOutput::failure("no process"),
            },
            _ => CommandOutput::failure(format!("unknown command: {line}")),
        }
    }

    fn complete_command(&self, line: &str, pos: usize) -> Vec<String> {
        let prefix = line.get(..pos).unwrap_or(line);
        Self::COMMANDS
            .iter()
            .filter(|cmd| cmd.starts_with(prefix))
            .map(|cmd| cmd.to_string())
            .collect()
    }
}

struct Inner {
    state: ProcessState,
    pid: Option<u32>,
    stop: Option<StopInfo>,
    exit: Option<i32>,
    memory: Vec<u8>,
    rsp: u64,
    rax: u64,
    breakpoints: BTreeMap<u32, u64>,
    next_bp: u32,
    stdout: VecDeque<u8>,
    stdin: Vec<u8>,
    destroyed: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ProcessState::Unloaded,
            pid: None,
            stop: None,
            exit: None,
            memory: vec![0x90; MockEngine::MAIN_SIZE as usize],
            rsp: 0x7fff_ffff_e000,
            rax: 0,
            breakpoints: BTreeMap::new(),
            next_bp: 0,
            stdout: VecDeque::new(),
            stdin: vec![],
            destroyed: false,
        }
    }

    fn pc(&self) -> u64 {
        self.stop.map(|s| s.pc).unwrap_or(MockEngine::ENTRY)
    }

    fn require_stopped(&self) -> Result<()> {
        if self.pid.is_none() || self.state.is_terminal() {
            return Err(EngineError::ProcessNotStarted);
        }
        if !self.state.is_stopped() {
            return Err(EngineError::ProcessRunning);
        }
        Ok(())
    }

    fn memory_range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(MockEngine::MAIN_BASE)
            .ok_or(EngineError::MemoryAccess(addr))? as usize;
        let end = start + len;
        if end > self.memory.len() {
            return Err(EngineError::MemoryAccess(addr));
        }
        Ok(start..end)
    }
}

pub struct MockTarget {
    knobs: Arc<Knobs>,
    executable: Option<PathBuf>,
    events_tx: Mutex<Sender<EngineEvent>>,
    events_rx: Mutex<Option<Receiver<EngineEvent>>>,
    inner: Mutex<Inner>,
}

impl MockTarget {
    fn emit(&self, event: EngineEvent) {
        _ = self.events_tx.lock().unwrap().send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: ProcessState) {
        inner.state = state;
        self.emit(EngineEvent::StateChanged(state));
    }

    fn main_module_desc(&self) -> Module {
        Module {
            path: self
                .executable
                .clone()
                .unwrap_or_else(|| PathBuf::from("/bin/mock")),
            uuid: Some("0011223344556677".to_string()),
            load_address: MockEngine::MAIN_BASE,
            file_address: MockEngine::MAIN_BASE,
            size: MockEngine::MAIN_SIZE,
            sections: vec![Section {
                name: ".text".to_string(),
                file_address: MockEngine::ENTRY,
                load_address: Some(MockEngine::ENTRY),
                byte_size: 0x800,
                file_byte_size: 0x800,
            }],
        }
    }

    fn start(&self, stop_reason: Option<StopReason>) {
        let mut inner = self.inner.lock().unwrap();
        self.set_state(&mut inner, ProcessState::Launching);
        inner.pid = Some(MockEngine::PID);
        let pc = if self.knobs.start_in_library.load(Ordering::SeqCst) {
            MockEngine::LIBRARY_PC
        } else {
            MockEngine::ENTRY
        };
        self.emit(EngineEvent::ModulesLoaded(vec![self.main_module_desc()]));
        match stop_reason {
            Some(reason) => {
                inner.stop = Some(StopInfo {
                    thread_id: MockEngine::PID as u64,
                    pc,
                    reason,
                });
                self.set_state(&mut inner, ProcessState::Stopped);
            }
            None => self.set_state(&mut inner, ProcessState::Running),
        }
    }

    pub fn push_stdout(&self, data: &[u8]) {
        self.inner.lock().unwrap().stdout.extend(data);
        self.emit(EngineEvent::Stdout);
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.inner.lock().unwrap().stdin.clone()
    }

    pub fn exit(&self, code: i32) {
        let mut inner = self.inner.lock().unwrap();
        inner.exit = Some(code);
        self.set_state(&mut inner, ProcessState::Exited);
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().unwrap().destroyed
    }

    pub fn pc(&self) -> u64 {
        self.inner.lock().unwrap().pc()
    }

    /// Addresses of breakpoints installed into a target.
    pub fn installed_breakpoints(&self) -> Vec<u64> {
        self.inner.lock().unwrap().breakpoints.values().copied().collect()
    }
}

impl Target for MockTarget {
    fn subscribe(&self) -> Option<Receiver<EngineEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    fn executable(&self) -> Option<PathBuf> {
        self.executable.clone()
    }

    fn launch(&self, info: &LaunchInfo) -> Result<()> {
        if self.knobs.fail_launch.load(Ordering::SeqCst) {
            return Err(EngineError::Failure("launch refused".to_string()));
        }
        self.start(info.stop_at_entry.then_some(StopReason::Exec));
        Ok(())
    }

    fn attach(&self, pid: u32) -> Result<()> {
        if pid == 0 {
            return Err(EngineError::ProcessNotFound(pid));
        }
        self.start(Some(StopReason::Signal));
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        self.inner.lock().unwrap().pid
    }

    fn state(&self) -> ProcessState {
        self.inner.lock().unwrap().state
    }

    fn stop_info(&self) -> Option<StopInfo> {
        self.inner.lock().unwrap().stop
    }

    fn exit_status(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit
    }

    fn resume(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_stopped()?;
        if self.knobs.fail_resume.load(Ordering::SeqCst) {
            return Err(EngineError::Failure("resume refused".to_string()));
        }
        self.set_state(&mut inner, ProcessState::Running);
        Ok(())
    }

    fn interrupt(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pid.is_none() {
            return Err(EngineError::ProcessNotStarted);
        }
        if inner.state.is_running() && !self.knobs.ignore_interrupt.load(Ordering::SeqCst) {
            let pc = inner.pc();
            inner.stop = Some(StopInfo {
                thread_id: MockEngine::PID as u64,
                pc,
                reason: StopReason::Signal,
            });
            self.set_state(&mut inner, ProcessState::Stopped);
        }
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pid.is_none() || inner.state.is_terminal() {
            return Err(EngineError::ProcessNotStarted);
        }
        inner.exit = Some(9);
        self.set_state(&mut inner, ProcessState::Exited);
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pid.is_none() || inner.state.is_terminal() {
            return Err(EngineError::ProcessNotStarted);
        }
        self.set_state(&mut inner, ProcessState::Detached);
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.destroyed = true;
        if inner.pid.is_some() && !inner.state.is_terminal() {
            self.set_state(&mut inner, ProcessState::Exited);
        }
        Ok(())
    }

    fn step(&self, tid: u64, kind: StepKind) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_stopped()?;
        if tid != MockEngine::PID as u64 {
            return Err(EngineError::ThreadNotFound(tid));
        }
        self.set_state(&mut inner, ProcessState::Stepping);
        if self.knobs.hang_steps.load(Ordering::SeqCst) {
            return Ok(());
        }

        let pc = inner.pc();
        let main = MockEngine::MAIN_BASE..MockEngine::MAIN_BASE + MockEngine::MAIN_SIZE;
        let (pc, reason) = match kind {
            StepKind::Instruction => (pc + 1, StopReason::Trace),
            StepKind::Over => (pc + 5, StopReason::PlanComplete),
            StepKind::Out if !main.contains(&pc) => {
                (MockEngine::ENTRY + 0x20, StopReason::PlanComplete)
            }
            StepKind::Out => (pc + 0x10, StopReason::PlanComplete),
        };
        inner.stop = Some(StopInfo {
            thread_id: tid,
            pc,
            reason,
        });
        self.set_state(&mut inner, ProcessState::Stopped);
        Ok(())
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        let inner = self.inner.lock().unwrap();
        let pid = inner.pid.ok_or(EngineError::ProcessNotStarted)?;
        Ok(vec![ThreadInfo {
            tid: pid as u64,
            stop_reason: inner.stop.map(|s| s.reason).unwrap_or(StopReason::None),
        }])
    }

    fn set_breakpoint(&self, addr: u64) -> Result<BreakpointInfo> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_bp += 1;
        let id = inner.next_bp;
        inner.breakpoints.insert(id, addr);
        Ok(BreakpointInfo {
            id,
            load_address: addr,
        })
    }

    fn remove_breakpoint(&self, id: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .breakpoints
            .remove(&id)
            .map(|_| ())
            .ok_or(EngineError::BreakpointNotFound(id))
    }

    fn remove_all_breakpoints(&self) -> Result<()> {
        self.inner.lock().unwrap().breakpoints.clear();
        Ok(())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        let range = inner.memory_range(addr, len)?;
        Ok(inner.memory[range].to_vec())
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let range = inner.memory_range(addr, data.len())?;
        inner.memory[range].copy_from_slice(data);
        Ok(data.len())
    }

    fn registers(&self, _tid: u64, frame: usize) -> Result<Vec<Register>> {
        let inner = self.inner.lock().unwrap();
        inner.require_stopped()?;
        let rip = match frame {
            0 => inner.pc(),
            1 => MockEngine::ENTRY + 0x100,
            _ => return Err(EngineError::FrameNotFound(frame)),
        };
        Ok(vec![
            Register {
                name: "rax".to_string(),
                value: inner.rax,
            },
            Register {
                name: "rsp".to_string(),
                value: inner.rsp,
            },
            Register {
                name: "rip".to_string(),
                value: rip,
            },
        ])
    }

    fn set_register(&self, tid: u64, _frame: usize, name: &str, value: u64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.require_stopped()?;
        match name {
            "rax" => inner.rax = value,
            "rsp" => inner.rsp = value,
            "rip" => {
                let reason = inner.stop.map(|s| s.reason).unwrap_or(StopReason::None);
                inner.stop = Some(StopInfo {
                    thread_id: tid,
                    pc: value,
                    reason,
                })
            }
            _ => return Err(EngineError::RegisterNameNotFound(name.to_string())),
        }
        Ok(())
    }

    fn call_stack(&self, _tid: u64) -> Result<Vec<Frame>> {
        if self.knobs.panic_on_call_stack.load(Ordering::SeqCst) {
            panic!("corrupted stack");
        }
        let inner = self.inner.lock().unwrap();
        inner.require_stopped()?;
        Ok(vec![
            Frame {
                pc: inner.pc(),
                function: Some("main".to_string()),
                module: Some("mock".to_string()),
                uuid: Some("0011223344556677".to_string()),
            },
            Frame {
                pc: MockEngine::ENTRY + 0x100,
                function: Some("_start".to_string()),
                module: Some("mock".to_string()),
                uuid: Some("0011223344556677".to_string()),
            },
        ])
    }

    fn disassemble(&self, addr: u64, count: usize) -> Result<Vec<Instruction>> {
        let inner = self.inner.lock().unwrap();
        let range = inner.memory_range(addr, count)?;
        Ok(inner.memory[range]
            .iter()
            .enumerate()
            .map(|(i, b)| Instruction {
                address: addr + i as u64,
                bytes: vec![*b],
                mnemonic: if *b == 0x90 { "nop" } else { "(bad)" }.to_string(),
                operands: String::new(),
            })
            .collect())
    }

    fn modules(&self) -> Result<Vec<Module>> {
        if self.inner.lock().unwrap().pid.is_none() {
            return Ok(vec![]);
        }
        Ok(vec![self.main_module_desc()])
    }

    fn main_module(&self) -> Result<Option<Module>> {
        Ok(self.modules()?.into_iter().next())
    }

    fn entry_point(&self) -> Result<u64> {
        Ok(MockEngine::ENTRY)
    }

    fn find_references(&self, addr: u64) -> Result<Vec<Instruction>> {
        let inner = self.inner.lock().unwrap();
        if inner.memory_range(addr, 1).is_err() {
            return Ok(vec![]);
        }
        let at = MockEngine::ENTRY + 0x10;
        Ok(vec![Instruction {
            address: at,
            bytes: vec![0x48, 0x8d, 0x3d, 0, 0, 0, 0],
            mnemonic: "lea".to_string(),
            operands: format!("rdi, [rip + 0x{:x}]", addr.wrapping_sub(at + 7)),
        }])
    }

    fn write_stdin(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.pid.is_none() {
            return Err(EngineError::ProcessNotStarted);
        }
        inner.stdin.extend_from_slice(data);
        Ok(data.len())
    }

    fn read_stdout(&self, max: usize) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let n = max.min(inner.stdout.len());
        Ok(inner.stdout.drain(..n).collect())
    }

    fn read_stderr(&self, _max: usize) -> Result<Vec<u8>> {
        Ok(vec![])
    }
}

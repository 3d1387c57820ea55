//! Debug engine capability.
//!
//! The bridge never talks to ptrace (or any other native debugger) directly. Everything it
//! needs from an engine is described by two traits: [`DebugEngine`], a factory for targets
//! plus a raw command interpreter, and [`Target`], an opaque handle to one debuggable
//! program image and its process.

pub mod error;
#[cfg(test)]
pub mod mock;
pub mod ptrace;

pub use error::EngineError;

use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use strum_macros::{Display, IntoStaticStr};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Process state as reported by an engine, codes are a part of the wire protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ProcessState {
    #[strum(serialize = "eStateInvalid")]
    Invalid,
    #[strum(serialize = "eStateUnloaded")]
    Unloaded,
    #[strum(serialize = "eStateConnected")]
    Connected,
    #[strum(serialize = "eStateAttaching")]
    Attaching,
    #[strum(serialize = "eStateLaunching")]
    Launching,
    #[strum(serialize = "eStateStopped")]
    Stopped,
    #[strum(serialize = "eStateRunning")]
    Running,
    #[strum(serialize = "eStateStepping")]
    Stepping,
    #[strum(serialize = "eStateCrashed")]
    Crashed,
    #[strum(serialize = "eStateDetached")]
    Detached,
    #[strum(serialize = "eStateExited")]
    Exited,
    #[strum(serialize = "eStateSuspended")]
    Suspended,
}

impl ProcessState {
    /// Numeric state code.
    pub fn code(self) -> u32 {
        match self {
            ProcessState::Invalid => 0,
            ProcessState::Unloaded => 1,
            ProcessState::Connected => 2,
            ProcessState::Attaching => 3,
            ProcessState::Launching => 4,
            ProcessState::Stopped => 5,
            ProcessState::Running => 6,
            ProcessState::Stepping => 7,
            ProcessState::Crashed => 8,
            ProcessState::Detached => 9,
            ProcessState::Exited => 10,
            ProcessState::Suspended => 11,
        }
    }

    /// True if process is halted and may be inspected.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            ProcessState::Stopped | ProcessState::Crashed | ProcessState::Suspended
        )
    }

    /// True if process is executing code right now.
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::Running | ProcessState::Stepping)
    }

    /// True if process is in the middle of launch or attach.
    pub fn is_transitional(self) -> bool {
        matches!(self, ProcessState::Launching | ProcessState::Attaching)
    }

    /// True if there is no process anymore.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Exited | ProcessState::Detached | ProcessState::Invalid
        )
    }
}

/// Cause of the most recent halt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum StopReason {
    Invalid,
    None,
    Trace,
    Breakpoint,
    Watchpoint,
    Signal,
    Exception,
    Exec,
    #[strum(serialize = "Plan Complete")]
    PlanComplete,
    #[strum(serialize = "Thread Exiting")]
    ThreadExiting,
    #[strum(serialize = "Unknown Reason")]
    Unknown,
}

/// Stop details of a halted process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopInfo {
    /// Thread that caused the stop.
    pub thread_id: u64,
    /// Program counter of that thread.
    pub pc: u64,
    pub reason: StopReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Execute exactly one machine instruction.
    Instruction,
    /// Like an instruction step, but a `call` is executed as a whole.
    Over,
    /// Run until the current function returns to its caller.
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
}

impl Arch {
    pub fn from_is64(is64: bool) -> Self {
        if is64 {
            Arch::X86_64
        } else {
            Arch::X86
        }
    }
}

/// Launch parameters for a prepared executable.
#[derive(Clone, Debug, Default)]
pub struct LaunchInfo {
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub disable_aslr: bool,
    pub stop_at_entry: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: u64,
    pub stop_reason: StopReason,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointInfo {
    pub id: u32,
    /// Address where int3 (or its equivalent) actually placed.
    pub load_address: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub value: u64,
}

/// One frame of an unwound call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub function: Option<String>,
    /// File name of a module which contains `pc`.
    pub module: Option<String>,
    pub uuid: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub file_address: u64,
    /// `None` if section is not mapped into process memory.
    pub load_address: Option<u64>,
    pub byte_size: u64,
    pub file_byte_size: u64,
}

/// Program image (executable or shared library) mapped into a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub path: PathBuf,
    /// Build id (or another unique image identifier) if known.
    pub uuid: Option<String>,
    /// Lowest address of image mappings in process memory.
    pub load_address: u64,
    /// Lowest virtual address of image loadable segments in a file.
    pub file_address: u64,
    /// Mapped image size.
    pub size: u64,
    pub sections: Vec<Section>,
}

impl Module {
    /// Relocation offset, `None` if image looks not relocated yet.
    pub fn slide(&self) -> Option<u64> {
        self.load_address.checked_sub(self.file_address)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    pub fn directory(&self) -> Option<&str> {
        self.path.parent().and_then(|dir| dir.to_str())
    }

    /// True if `addr` belongs to image mappings.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.load_address && addr < self.load_address.saturating_add(self.size)
    }

    /// Match by a full path or by a file name.
    pub fn matches_file(&self, file: &str) -> bool {
        self.path == Path::new(file) || self.file_name() == Some(file)
    }
}

/// Engine-originated events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    StateChanged(ProcessState),
    /// New data available, use [`Target::read_stdout`].
    Stdout,
    /// New data available, use [`Target::read_stderr`].
    Stderr,
    ModulesLoaded(Vec<Module>),
    ModulesUnloaded(Vec<Module>),
}

/// Optional engine features, resolved once at session creation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub remote_connect: bool,
    pub raw_commands: bool,
    pub reference_scan: bool,
}

/// Result of a raw engine command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
    pub error: String,
    pub succeeded: bool,
}

impl CommandOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
            succeeded: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            succeeded: false,
        }
    }
}

/// Focus for a raw command: a target and its selected thread/frame.
#[derive(Clone, Copy)]
pub struct CommandContext<'a> {
    pub target: Option<&'a dyn Target>,
    pub thread: Option<u64>,
    pub frame: usize,
}

/// Engine factory and raw command interpreter.
pub trait DebugEngine: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Create a new target for an executable.
    /// Executable may be omitted if it will be known later (attach by pid).
    fn create_target(&self, executable: Option<&Path>, arch: Arch) -> Result<Arc<dyn Target>>;

    fn execute_command(&self, ctx: CommandContext, line: &str) -> CommandOutput;

    /// Return completions of a command line, `pos` is a cursor position.
    fn complete_command(&self, line: &str, pos: usize) -> Vec<String>;
}

/// Handle to a debuggable program image and its process.
///
/// All operations are synchronous from the caller point of view. Operations with
/// unbounded duration (resume, steps that run code) only start an execution and return,
/// completion is observable through [`Target::state`] and [`EngineEvent::StateChanged`].
pub trait Target: Send + Sync {
    /// Return an event receiver. There is only one receiver per target,
    /// all subsequent calls return `None`.
    fn subscribe(&self) -> Option<Receiver<EngineEvent>>;

    fn executable(&self) -> Option<PathBuf>;

    fn launch(&self, info: &LaunchInfo) -> Result<()>;

    fn attach(&self, pid: u32) -> Result<()>;

    fn connect_remote(&self, _url: &str, _plugin: &str) -> Result<()> {
        Err(EngineError::Unsupported("remote connection"))
    }

    fn process_id(&self) -> Option<u32>;

    fn state(&self) -> ProcessState;

    fn stop_info(&self) -> Option<StopInfo>;

    fn exit_status(&self) -> Option<i32>;

    fn resume(&self) -> Result<()>;

    /// Request an asynchronous halt, the stop itself is reported by a state change.
    fn interrupt(&self) -> Result<()>;

    fn kill(&self) -> Result<()>;

    fn detach(&self) -> Result<()>;

    /// Kill the process (if any) and release all engine resources.
    fn destroy(&self) -> Result<()>;

    fn step(&self, tid: u64, kind: StepKind) -> Result<()>;

    fn threads(&self) -> Result<Vec<ThreadInfo>>;

    fn set_breakpoint(&self, addr: u64) -> Result<BreakpointInfo>;

    fn remove_breakpoint(&self, id: u32) -> Result<()>;

    fn remove_all_breakpoints(&self) -> Result<()>;

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>>;

    /// Write bytes into process memory, return written bytes count.
    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<usize>;

    fn registers(&self, tid: u64, frame: usize) -> Result<Vec<Register>>;

    fn set_register(&self, tid: u64, frame: usize, name: &str, value: u64) -> Result<()>;

    fn call_stack(&self, tid: u64) -> Result<Vec<Frame>>;

    fn disassemble(&self, addr: u64, count: usize) -> Result<Vec<Instruction>>;

    fn modules(&self) -> Result<Vec<Module>>;

    fn main_module(&self) -> Result<Option<Module>>;

    /// Relocated address of the main executable entry point.
    fn entry_point(&self) -> Result<u64>;

    /// Return instructions of the main executable that reference `addr`.
    fn find_references(&self, _addr: u64) -> Result<Vec<Instruction>> {
        Err(EngineError::Unsupported("reference scanning"))
    }

    fn write_stdin(&self, data: &[u8]) -> Result<usize>;

    fn read_stdout(&self, max: usize) -> Result<Vec<u8>>;

    fn read_stderr(&self, max: usize) -> Result<Vec<u8>>;
}

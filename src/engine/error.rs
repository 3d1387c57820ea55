#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("{0} is not supported by this engine")]
    Unsupported(&'static str),
    #[error("tracer thread is gone")]
    TracerGone,
    #[error("{0}")]
    Failure(String),

    // --------------------------------- target errors ---------------------------------------------
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("process already running")]
    AlreadyRun,
    #[error("process is not started")]
    ProcessNotStarted,
    #[error("process is running")]
    ProcessRunning,
    #[error("process exit with code {0}")]
    ProcessExit(i32),
    #[error("process pid {0} not found")]
    ProcessNotFound(u32),

    // --------------------------------- entity not found ------------------------------------------
    #[error("thread {0} not found")]
    ThreadNotFound(u64),
    #[error("frame number {0} not found")]
    FrameNotFound(usize),
    #[error("unknown register {0}")]
    RegisterNameNotFound(String),
    #[error("breakpoint {0} not found")]
    BreakpointNotFound(u32),
    #[error("return address not found")]
    ReturnAddressNotFound,
    #[error("main module not loaded")]
    NoMainModule,

    // --------------------------------- remote memory errors --------------------------------------
    #[error("unable to access memory at 0x{0:x}")]
    MemoryAccess(u64),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("attach a running process: {0}")]
    Attach(nix::Error),
    #[error("single step is not completed after {0} restarts")]
    StepNotCompleted(u32),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- disasm ----------------------------------------------------
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),
}

impl EngineError {
    /// Return a hint - is target still usable after this error or not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::TracerGone | EngineError::Waitpid(_))
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "bridge", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "bridge", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

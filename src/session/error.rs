use crate::engine::EngineError;

/// Error class, visible to a frontend only through an error message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed message or argument, session state unchanged.
    BadRequest,
    /// Command is not valid in current lifecycle state.
    InvalidState,
    /// Engine reports a failure.
    EngineFailure,
    UnknownCommand,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- request errors --------------------------------------------
    #[error("cannot decode JSON: {0}")]
    Decode(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    // --------------------------------- lifecycle errors ------------------------------------------
    #[error("no process")]
    NoProcess,
    #[error("no target")]
    NoTarget,
    #[error("process already exists")]
    AlreadyExists,
    #[error("no executable prepared")]
    NotPrepared,
    #[error("no thread selected")]
    NoThreadSelected,
    #[error("{0} is not supported")]
    Unsupported(&'static str),

    // --------------------------------- focus errors ----------------------------------------------
    #[error("no thread {0}")]
    NoThread(u64),
    #[error("frame number {0} not found")]
    FrameNotFound(usize),
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("can't find module")]
    ModuleNotFound,
    #[error("register not found")]
    RegisterNotFound,

    // --------------------------------- engine errors ---------------------------------------------
    #[error("cannot build target: {0}")]
    TargetCreationFailed(#[source] EngineError),
    #[error("cannot create process: {0}")]
    LaunchFailed(#[source] EngineError),
    #[error("cannot attach to process: {0}")]
    AttachFailed(#[source] EngineError),
    #[error("cannot connect to remote: {0}")]
    ConnectFailed(#[source] EngineError),
    #[error("{0}: {1}")]
    Engine(&'static str, #[source] EngineError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Decode(_) => ErrorKind::BadRequest,
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::UnknownCommand(_) => ErrorKind::UnknownCommand,

            Error::NoProcess => ErrorKind::InvalidState,
            Error::NoTarget => ErrorKind::InvalidState,
            Error::AlreadyExists => ErrorKind::InvalidState,
            Error::NotPrepared => ErrorKind::InvalidState,
            Error::NoThreadSelected => ErrorKind::InvalidState,
            Error::Unsupported(_) => ErrorKind::InvalidState,

            Error::NoThread(_) => ErrorKind::BadRequest,
            Error::FrameNotFound(_) => ErrorKind::BadRequest,
            Error::IndexOutOfRange => ErrorKind::BadRequest,
            Error::ModuleNotFound => ErrorKind::BadRequest,
            Error::RegisterNotFound => ErrorKind::BadRequest,

            Error::TargetCreationFailed(_) => ErrorKind::EngineFailure,
            Error::LaunchFailed(_) => ErrorKind::EngineFailure,
            Error::AttachFailed(_) => ErrorKind::EngineFailure,
            Error::ConnectFailed(_) => ErrorKind::EngineFailure,
            Error::Engine(_, _) => ErrorKind::EngineFailure,
            Error::Internal(_) => ErrorKind::EngineFailure,
        }
    }

    /// Underlying engine error, if any.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Error::TargetCreationFailed(e)
            | Error::LaunchFailed(e)
            | Error::AttachFailed(e)
            | Error::ConnectFailed(e)
            | Error::Engine(_, e) => Some(e),
            _ => None,
        }
    }
}

/// Attach an operation name to an engine error.
pub trait EngineResultExt<T> {
    fn op(self, op: &'static str) -> Result<T, Error>;
}

impl<T> EngineResultExt<T> for Result<T, EngineError> {
    fn op(self, op: &'static str) -> Result<T, Error> {
        self.map_err(|e| Error::Engine(op, e))
    }
}

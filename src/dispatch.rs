//! Request dispatcher.
//!
//! Turns one decoded frame into exactly one [`Response`]. Argument errors become
//! `bad request` replies, unknown commands and handler panics become error replies,
//! nothing here can stop the server loop.

use crate::engine::StepKind;
use crate::protocol::Response;
use crate::session::{Error, ErrorKind, Executable, Session};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

/// Handle a single inbound payload.
pub fn handle_frame(session: &mut Session, payload: &[u8]) -> Response {
    let (correlation, result) = match decode(payload) {
        Ok(request) => {
            debug!(target: "bridge", "command: {}", request.command);
            let command = request.command.clone();
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                execute(session, &request.command, request.doc)
            }))
            .unwrap_or_else(|payload| {
                error!(target: "bridge", "command '{command}' panicked");
                Err(Error::Internal(panic_message(payload)))
            });
            (request.correlation, result)
        }
        Err((correlation, e)) => (correlation, Err(e)),
    };

    let response = match result {
        Ok(response) => response,
        Err(e) => {
            log_error(&e);
            Response::error(e.to_string())
        }
    };
    response.with_id(correlation)
}

struct Request {
    command: String,
    correlation: Option<Value>,
    doc: Value,
}

fn decode(payload: &[u8]) -> Result<Request, (Option<Value>, Error)> {
    let doc: Value =
        serde_json::from_slice(payload).map_err(|e| (None, Error::Decode(e.to_string())))?;
    let Value::Object(ref fields) = doc else {
        return Err((None, Error::Decode("expected a JSON object".to_string())));
    };
    let correlation = fields.get("id").cloned();
    let Some(command) = fields
        .get("command")
        .and_then(Value::as_str)
        .map(ToString::to_string)
    else {
        return Err((
            correlation,
            Error::BadRequest("missing command field".to_string()),
        ));
    };

    Ok(Request {
        command,
        correlation,
        doc,
    })
}

fn log_error(e: &Error) {
    if e.engine_error().is_some_and(|e| e.is_fatal()) {
        error!(target: "bridge", "{e:#}");
        return;
    }
    match e.kind() {
        ErrorKind::BadRequest | ErrorKind::UnknownCommand => info!(target: "bridge", "{e}"),
        ErrorKind::InvalidState => debug!(target: "bridge", "{e}"),
        ErrorKind::EngineFailure => warn!(target: "bridge", "{e:#}"),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "command handler panicked".to_string()
}

fn args<T: DeserializeOwned>(command: &str, doc: Value) -> Result<T, Error> {
    serde_json::from_value(doc).map_err(|e| Error::BadRequest(format!("{command}: {e}")))
}

fn execute(session: &mut Session, command: &str, doc: Value) -> Result<Response, Error> {
    match command {
        "ping" => Ok(Response::ok()),

        // lifecycle
        "prepareExecutable" => {
            let args: PrepareArgs = args(command, doc)?;
            session.prepare(args.into_executable())
        }
        "createProcess" | "launch" => session.launch(),
        "attachToProcess" => {
            let args: AttachArgs = args(command, doc)?;
            session.attach(args.pid, non_empty_path(args.executable), args.is_64)
        }
        "connectRemote" => {
            let args: ConnectArgs = args(command, doc)?;
            if let Some(platform) = args.platform.as_deref() {
                debug!(target: "bridge", "remote platform: {platform}");
            }
            session.connect_remote(
                args.is_64,
                &args.url,
                &args.plugin,
                non_empty_path(args.file),
            )
        }
        "detach" => session.detach(),
        "deleteProcess" => session.delete_process(),
        "hasProcess" => session.has_process(),
        "getProcessState" => session.process_state(),

        // execution control
        "continueExecution" => session.resume(),
        "stopExecution" => session.kill(),
        "breakExecution" => session.interrupt(),
        "forceStopAndReport" => session.force_stop_and_report(),
        "stepInstruction" => session.step(StepKind::Instruction),
        "stepOver" => session.step(StepKind::Over),
        "stepOut" => session.step(StepKind::Out),
        "stepUntilUserCode" => session.step_until_user_code(),

        // threads and frames
        "getThreadIDList" => session.threads(),
        "selectThreadID" => {
            let args: ThreadArgs = args(command, doc)?;
            session.select_thread(args.tid)
        }
        "getCallstack" => session.call_stack(),
        "selectFrame" => {
            let args: FrameArgs = args(command, doc)?;
            session.select_frame(args.index)
        }

        // registers and memory
        "getRegisters" => session.registers(),
        "setRegister" => {
            let args: SetRegisterArgs = args(command, doc)?;
            session.set_register(&args.register, args.value)
        }
        "readMemory" => {
            let args: ReadMemoryArgs = args(command, doc)?;
            session.read_memory(args.address, args.length)
        }
        "writeByte" => {
            let args: WriteByteArgs = args(command, doc)?;
            let value = u8::try_from(args.value).map_err(|_| {
                Error::BadRequest(format!("{command}: value {} is not a byte", args.value))
            })?;
            session.write_byte(args.address, value)
        }
        "sendToApplication" => {
            let args: SendArgs = args(command, doc)?;
            session.send_to_application(&args.data.into_bytes())
        }

        // breakpoints
        "setBreakpointAtVirtualAddress" => {
            let args: AddressArgs = args(command, doc)?;
            session.set_breakpoint(args.address)
        }
        "removeBreakpoint" => {
            let args: RemoveBreakpointArgs = args(command, doc)?;
            session.remove_breakpoint(args.bkpt_id)
        }
        "removeAllBreakpoints" => session.remove_all_breakpoints(),

        // code view
        "disassembly" => {
            let args: DisassemblyArgs = args(command, doc)?;
            session.disassembly(args.address, args.count)
        }
        "getMainExecutableDisassembly" => {
            let args: CountArgs = args(command, doc)?;
            session.main_executable_disassembly(args.count)
        }
        "findStringReferences" => {
            let args: StringReferencesArgs = args(command, doc)?;
            session.find_string_references(args.string_address)
        }

        // modules
        "moduleCount" => session.module_count(),
        "moduleAtIndex" => {
            let args: ModuleIndexArgs = args(command, doc)?;
            session.module_at_index(args.index)
        }
        "moduleForFile" => {
            let args: ModuleFileArgs = args(command, doc)?;
            session.module_for_file(&args.file)
        }

        // raw engine commands
        "executeCommand" => {
            let args: CliArgs = args(command, doc)?;
            session.execute_command(&args.cli)
        }
        "completeCommand" => {
            let args: CompleteArgs = args(command, doc)?;
            let pos = args.pos.unwrap_or(args.cli.len());
            session.complete_command(&args.cli, pos)
        }

        other => Err(Error::UnknownCommand(other.to_string())),
    }
}

fn non_empty_path(path: Option<String>) -> Option<PathBuf> {
    path.filter(|p| !p.trim().is_empty()).map(PathBuf::from)
}

// --------------------------------- argument types ------------------------------------------------

fn yes() -> bool {
    true
}

/// Address or register value: a JSON number, or a decimal or `0x` prefixed hex string.
fn address<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => parse_address(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid address '{text}'"))
        }),
    }
}

fn parse_address(text: &str) -> Option<u64> {
    let text = text.trim();
    match text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Program arguments: a list of strings or a single command line.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProgramArgs {
    List(Vec<String>),
    Line(String),
}

impl ProgramArgs {
    fn into_vec(self) -> Vec<String> {
        match self {
            ProgramArgs::List(list) => list,
            ProgramArgs::Line(line) => split_command_line(&line),
        }
    }
}

/// Split on whitespace, single and double quotes group words.
fn split_command_line(line: &str) -> Vec<String> {
    let mut words = vec![];
    let mut current = String::new();
    let mut in_word = false;
    let mut quote = None;

    for ch in line.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Deserialize)]
struct PrepareArgs {
    path: PathBuf,
    #[serde(rename = "is64Bits", default = "yes")]
    is_64: bool,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    args: Option<ProgramArgs>,
}

impl PrepareArgs {
    fn into_executable(self) -> Executable {
        Executable {
            path: self.path,
            is_64: self.is_64,
            cwd: non_empty_path(self.cwd),
            args: self.args.map(ProgramArgs::into_vec).unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct AttachArgs {
    pid: u32,
    #[serde(default)]
    executable: Option<String>,
    #[serde(rename = "is64Bits", default = "yes")]
    is_64: bool,
}

#[derive(Deserialize)]
struct ConnectArgs {
    #[serde(rename = "is64Bits", default = "yes")]
    is_64: bool,
    url: String,
    #[serde(default)]
    plugin: String,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    file: Option<String>,
}

#[derive(Deserialize)]
struct ThreadArgs {
    tid: u64,
}

#[derive(Deserialize)]
struct FrameArgs {
    index: usize,
}

#[derive(Deserialize)]
struct SetRegisterArgs {
    register: String,
    #[serde(deserialize_with = "address")]
    value: u64,
}

#[derive(Deserialize)]
struct AddressArgs {
    #[serde(deserialize_with = "address")]
    address: u64,
}

#[derive(Deserialize)]
struct ReadMemoryArgs {
    #[serde(deserialize_with = "address")]
    address: u64,
    length: usize,
}

#[derive(Deserialize)]
struct WriteByteArgs {
    #[serde(deserialize_with = "address")]
    address: u64,
    value: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SendData {
    Bytes(Vec<u8>),
    Text(String),
}

impl SendData {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            SendData::Bytes(bytes) => bytes,
            SendData::Text(text) => text.into_bytes(),
        }
    }
}

#[derive(Deserialize)]
struct SendArgs {
    data: SendData,
}

#[derive(Deserialize)]
struct RemoveBreakpointArgs {
    bkpt_id: u32,
}

fn default_disassembly_count() -> usize {
    32
}

#[derive(Deserialize)]
struct DisassemblyArgs {
    #[serde(deserialize_with = "address")]
    address: u64,
    #[serde(default = "default_disassembly_count")]
    count: usize,
}

#[derive(Deserialize)]
struct CountArgs {
    #[serde(default = "default_disassembly_count")]
    count: usize,
}

#[derive(Deserialize)]
struct StringReferencesArgs {
    #[serde(rename = "stringAddress", deserialize_with = "address")]
    string_address: u64,
}

#[derive(Deserialize)]
struct ModuleIndexArgs {
    index: i64,
}

#[derive(Deserialize)]
struct ModuleFileArgs {
    file: String,
}

#[derive(Deserialize)]
struct CliArgs {
    cli: String,
}

#[derive(Deserialize)]
struct CompleteArgs {
    cli: String,
    #[serde(default)]
    pos: Option<usize>,
}

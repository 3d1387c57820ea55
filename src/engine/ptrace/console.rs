//! Raw command interpreter of the ptrace engine.

use crate::engine::{CommandContext, CommandOutput, EngineError, Target};
use itertools::Itertools;
use std::fmt::Write;
use std::str::FromStr;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use trie_rs::{Trie, TrieBuilder};

const DEFAULT_DISASM_COUNT: usize = 16;
const MEMORY_ROW_LEN: usize = 16;
const MAX_MEMORY_DUMP: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
enum Command {
    Help,
    Registers,
    Memory,
    Disassemble,
    Threads,
    Backtrace,
    Modules,
    State,
}

impl Command {
    fn usage(self) -> &'static str {
        match self {
            Command::Help => "help                        -- list commands",
            Command::Registers => "registers                   -- registers of a selected frame",
            Command::Memory => "memory <addr> <len>         -- hex dump of process memory",
            Command::Disassemble => "disassemble <addr> [count]  -- disassemble instructions",
            Command::Threads => "threads                     -- list process threads",
            Command::Backtrace => "backtrace                   -- call stack of a selected thread",
            Command::Modules => "modules                     -- list loaded images",
            Command::State => "state                       -- process state",
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("no process")]
    NoTarget,
    #[error("no thread selected")]
    NoThread,
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub struct Console {
    commands: Trie<u8>,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        let mut builder = TrieBuilder::new();
        Command::iter().for_each(|cmd| builder.push(cmd.to_string()));
        Self {
            commands: builder.build(),
        }
    }

    pub fn execute(&self, ctx: CommandContext, line: &str) -> CommandOutput {
        match run(ctx, line) {
            Ok(output) => CommandOutput::success(output),
            Err(e) => CommandOutput::failure(e.to_string()),
        }
    }

    /// Complete a command name, arguments are never completed.
    pub fn complete(&self, line: &str, pos: usize) -> Vec<String> {
        let prefix = line.get(..pos).unwrap_or(line).trim_start();
        if prefix.contains(char::is_whitespace) {
            return vec![];
        }
        if prefix.is_empty() {
            return Command::iter().map(|cmd| cmd.to_string()).sorted().collect();
        }
        let results: Vec<Vec<u8>> = self.commands.predictive_search(prefix);
        results
            .iter()
            .filter_map(|cmd| std::str::from_utf8(cmd).ok())
            .map(ToString::to_string)
            .sorted()
            .collect()
    }
}

fn parse_number(s: &str) -> Result<u64, CommandError> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|_| CommandError::Argument(s.to_string()))
}

fn target<'a>(ctx: &CommandContext<'a>) -> Result<&'a dyn Target, CommandError> {
    ctx.target.ok_or(CommandError::NoTarget)
}

fn selected_thread(ctx: &CommandContext) -> Result<u64, CommandError> {
    let target = target(ctx)?;
    ctx.thread
        .or_else(|| target.stop_info().map(|stop| stop.thread_id))
        .ok_or(CommandError::NoThread)
}

fn run(ctx: CommandContext, line: &str) -> Result<String, CommandError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(String::new());
    };
    let cmd = Command::from_str(name).map_err(|_| CommandError::Unknown(name.to_string()))?;
    let args: Vec<&str> = words.collect();

    let mut out = String::new();
    match cmd {
        Command::Help => {
            out = Command::iter().map(Command::usage).join("\n");
        }
        Command::State => {
            let target = target(&ctx)?;
            _ = write!(out, "{}", target.state());
            if let Some(pid) = target.process_id() {
                _ = write!(out, " pid={pid}");
            }
            if let Some(stop) = target.stop_info() {
                _ = write!(
                    out,
                    " thread={} pc=0x{:016x} reason={}",
                    stop.thread_id, stop.pc, stop.reason
                );
            }
            if let Some(code) = target.exit_status() {
                _ = write!(out, " exit={code}");
            }
        }
        Command::Registers => {
            let tid = selected_thread(&ctx)?;
            let registers = target(&ctx)?.registers(tid, ctx.frame)?;
            out = registers
                .iter()
                .map(|reg| format!("{:>8} = 0x{:016x}", reg.name, reg.value))
                .join("\n");
        }
        Command::Memory => {
            let [addr, len] = args[..] else {
                return Err(CommandError::Argument("usage: memory <addr> <len>".to_string()));
            };
            let addr = parse_number(addr)?;
            let len = (parse_number(len)? as usize).min(MAX_MEMORY_DUMP);
            let data = target(&ctx)?.read_memory(addr, len)?;
            out = data
                .chunks(MEMORY_ROW_LEN)
                .enumerate()
                .map(|(i, row)| {
                    format!(
                        "0x{:016x}: {}",
                        addr + (i * MEMORY_ROW_LEN) as u64,
                        row.iter().map(|b| format!("{b:02x}")).join(" ")
                    )
                })
                .join("\n");
        }
        Command::Disassemble => {
            let (addr, count) = match args[..] {
                [addr] => (parse_number(addr)?, DEFAULT_DISASM_COUNT),
                [addr, count] => (parse_number(addr)?, parse_number(count)? as usize),
                _ => {
                    return Err(CommandError::Argument(
                        "usage: disassemble <addr> [count]".to_string(),
                    ))
                }
            };
            let instructions = target(&ctx)?.disassemble(addr, count)?;
            out = instructions
                .iter()
                .map(|insn| {
                    format!("0x{:016x}: {} {}", insn.address, insn.mnemonic, insn.operands)
                        .trim_end()
                        .to_string()
                })
                .join("\n");
        }
        Command::Threads => {
            let target = target(&ctx)?;
            let current = target.stop_info().map(|stop| stop.thread_id);
            out = target
                .threads()?
                .iter()
                .map(|thread| {
                    let mark = if Some(thread.tid) == current { '*' } else { ' ' };
                    format!("{mark} thread {} ({})", thread.tid, thread.stop_reason)
                })
                .join("\n");
        }
        Command::Backtrace => {
            let tid = selected_thread(&ctx)?;
            let frames = target(&ctx)?.call_stack(tid)?;
            out = frames
                .iter()
                .enumerate()
                .map(|(num, frame)| {
                    format!(
                        "#{num} 0x{:016x} {} ({})",
                        frame.pc,
                        frame.function.as_deref().unwrap_or("??"),
                        frame.module.as_deref().unwrap_or("??"),
                    )
                })
                .join("\n");
        }
        Command::Modules => {
            out = target(&ctx)?
                .modules()?
                .iter()
                .map(|module| {
                    format!(
                        "0x{:016x}-0x{:016x} {} {}",
                        module.load_address,
                        module.load_address + module.size,
                        module.path.display(),
                        module.uuid.as_deref().unwrap_or("-"),
                    )
                })
                .join("\n");
        }
    }
    Ok(out)
}

//! Start or attach a traced process.

use crate::engine::ptrace::shared::{
    spawn_input_pump, spawn_output_pump, InputPump, Shared, Stream,
};
use crate::engine::{EngineError, EngineEvent, LaunchInfo};
use log::debug;
use nix::errno::Errno;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::HashSet;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use sysinfo::{RefreshKind, System};

/// Options for every traced thread. Launched processes are killed with the tracer,
/// attached ones are left alive.
pub fn trace_options(exit_kill: bool) -> Options {
    let options = Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT);
    if exit_kill {
        options.union(Options::PTRACE_O_EXITKILL)
    } else {
        options
    }
}

pub struct Launched {
    pub pid: Pid,
    pub stdin: InputPump,
}

/// Start a program under ptrace. Must be called from the tracer thread,
/// the calling thread becomes a tracer of the new process.
/// Process is stopped right after `exec`.
pub fn launch(
    program: &Path,
    info: &LaunchInfo,
    shared: &Arc<Shared>,
    events: &Sender<EngineEvent>,
) -> Result<Launched, EngineError> {
    let (stdin_reader, stdin_writer) = os_pipe::pipe()?;
    let (stdout_reader, stdout_writer) = os_pipe::pipe()?;
    let (stderr_reader, stderr_writer) = os_pipe::pipe()?;

    let mut cmd = Command::new(program);
    cmd.args(&info.args)
        .stdin(stdin_reader)
        .stdout(stdout_writer)
        .stderr(stderr_writer);
    if let Some(cwd) = info.cwd.as_deref() {
        cmd.current_dir(cwd);
    }

    let disable_aslr = info.disable_aslr;
    unsafe {
        cmd.pre_exec(move || {
            if disable_aslr {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
            }
            sys::ptrace::traceme()?;
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    // parent copies of child pipe ends must be closed, otherwise readers never see EOF
    drop(cmd);
    let pid = Pid::from_raw(child.id() as i32);
    debug!(target: "tracer", "process {pid} spawned");

    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(EngineError::Waitpid)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => break,
            WaitStatus::Exited(_, code) => return Err(EngineError::ProcessExit(code)),
            WaitStatus::Signaled(_, signal, _) => {
                return Err(EngineError::ProcessExit(signal as i32))
            }
            status => debug!(target: "tracer", "unexpected status before exec: {status:?}"),
        }
    }
    sys::ptrace::setoptions(pid, trace_options(true)).map_err(EngineError::Ptrace)?;

    spawn_output_pump(stdout_reader, Stream::Stdout, shared.clone(), events.clone())?;
    spawn_output_pump(stderr_reader, Stream::Stderr, shared.clone(), events.clone())?;
    let stdin = spawn_input_pump(stdin_writer)?;

    Ok(Launched { pid, stdin })
}

pub struct Attached {
    /// Process threads, each one is stopped.
    pub threads: Vec<Pid>,
    /// Signals received while waiting for the attach stop.
    pub pending: Vec<(Pid, Signal)>,
    pub executable: Option<PathBuf>,
}

/// Attach to every thread of a running process.
pub fn attach(pid: u32) -> Result<Attached, EngineError> {
    let mut attached: HashSet<Pid> = HashSet::new();
    let mut pending = vec![];
    let mut executable = None;

    // two rounds, threads created during the first round are attached at the second one
    for _ in 0..2 {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        let Some(process) = sys.process(sysinfo::Pid::from_u32(pid)) else {
            if attached.is_empty() {
                return Err(EngineError::ProcessNotFound(pid));
            }
            break;
        };
        executable = process.exe().map(Path::to_path_buf);

        let main = Pid::from_raw(pid as i32);
        let mut threads = vec![main];
        if let Some(tasks) = process.tasks() {
            threads.extend(tasks.iter().map(|tid| Pid::from_raw(tid.as_u32() as i32)));
        }
        threads.sort();
        threads.dedup();
        threads.retain(|tid| !attached.contains(tid));

        for tid in threads {
            match sys::ptrace::attach(tid) {
                Ok(()) => {}
                // thread exited after enumeration
                Err(Errno::ESRCH) if tid != main => continue,
                Err(Errno::ESRCH) => return Err(EngineError::ProcessNotFound(pid)),
                Err(e) => return Err(EngineError::Attach(e)),
            }
            let alive = loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(EngineError::Attach)? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => break true,
                    WaitStatus::Stopped(_, signal) => {
                        pending.push((tid, signal));
                        break true;
                    }
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break false,
                    status => debug!(target: "tracer", "attach {tid}: {status:?}"),
                }
            };
            if !alive {
                continue;
            }
            sys::ptrace::setoptions(tid, trace_options(false)).map_err(EngineError::Ptrace)?;
            attached.insert(tid);
        }
    }

    let mut threads: Vec<Pid> = attached.into_iter().collect();
    threads.sort();
    Ok(Attached {
        threads,
        pending,
        executable,
    })
}

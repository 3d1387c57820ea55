use anyhow::{bail, Context};
use bs_bridge::config::BridgeConfig;
use bs_bridge::engine::ptrace::PtraceEngine;
use bs_bridge::protocol::trace::WireTracer;
use bs_bridge::protocol::{FrameReader, Framing, Outbox};
use bs_bridge::server::Server;
use bs_bridge::session::Session;
use clap::Parser;
use log::info;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

/// Debugger bridge: serves framed JSON commands from a frontend and drives a ptrace engine.
///
/// With two descriptors the bridge speaks length-prefixed binary frames over them,
/// without descriptors it reads newline-delimited commands from stdin.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a configuration file (default: ~/.config/bs-bridge/config.toml)
    #[clap(long, env = "BS_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter directives, e.g. `debug` or `session=trace`
    #[clap(long)]
    log_level: Option<String>,

    /// Write logs into a file instead of stderr
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace wire messages into the log file. Requires --log-file.
    #[clap(long)]
    trace_wire: bool,

    /// Inherited descriptor to read commands from
    input_fd: Option<RawFd>,

    /// Inherited descriptor to write replies and notifications to
    output_fd: Option<RawFd>,
}

/// Take ownership of an inherited descriptor. The descriptor is duplicated first,
/// so an invalid number is reported instead of silently producing a broken stream.
fn inherited(fd: RawFd) -> anyhow::Result<File> {
    let owned = nix::unistd::dup(fd).with_context(|| format!("invalid descriptor {fd}"))?;
    // SAFETY: `owned` is a fresh descriptor, nothing else owns it
    Ok(unsafe { File::from_raw_fd(owned) })
}

fn serve<R: BufRead>(
    input: R,
    output: impl Write + Send + 'static,
    framing: Framing,
    config: BridgeConfig,
    tracer: Option<WireTracer>,
) {
    let reader = FrameReader::new(input, framing, config.transport.max_frame_len);
    let outbox = Outbox::new(output, framing).with_tracer(tracer.clone());
    let session = Session::new(Arc::new(PtraceEngine::new()), config, outbox.clone());
    Server::new(reader, outbox, session)
        .with_tracer(tracer)
        .run();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(args.config.as_deref())?;
    if args.log_level.is_some() {
        config.log.level = args.log_level;
    }
    if args.log_file.is_some() {
        config.log.file = args.log_file;
    }
    config.log.trace_wire |= args.trace_wire;

    let tracer = bs_bridge::log::init(&config.log)?;

    match (args.input_fd, args.output_fd) {
        (Some(input_fd), Some(output_fd)) => {
            let input = BufReader::new(inherited(input_fd)?);
            let output = inherited(output_fd)?;
            info!(target: "bridge", "binary mode on descriptors {input_fd} {output_fd}");
            serve(input, output, Framing::Binary, config, tracer);
        }
        (None, None) => {
            info!(target: "bridge", "line mode on stdin/stdout");
            serve(
                std::io::stdin().lock(),
                std::io::stdout(),
                Framing::Line,
                config,
                tracer,
            );
        }
        _ => bail!("both INPUT_FD and OUTPUT_FD must be given, or none of them"),
    }

    Ok(())
}

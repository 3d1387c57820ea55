//! Read-dispatch loop.

use crate::dispatch::handle_frame;
use crate::protocol::trace::{Direction, WireTracer};
use crate::protocol::{FrameReader, Outbox, Response};
use crate::session::Session;
use log::{debug, info, warn};
use std::io::BufRead;

/// Owns the inbound stream and the session, writes replies through the shared outbox.
pub struct Server<R: BufRead> {
    reader: FrameReader<R>,
    outbox: Outbox,
    session: Session,
    tracer: Option<WireTracer>,
}

impl<R: BufRead> Server<R> {
    pub fn new(reader: FrameReader<R>, outbox: Outbox, session: Session) -> Self {
        Self {
            reader,
            outbox,
            session,
            tracer: None,
        }
    }

    /// Trace inbound messages, outbound are traced by an outbox.
    pub fn with_tracer(mut self, tracer: Option<WireTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Serve until the input stream is closed or broken.
    /// Session is shut down before the final `EOF` acknowledgement.
    pub fn run(mut self) {
        info!(target: "bridge", "serving in {:?} mode", self.reader.framing());
        if let Some(ref tracer) = self.tracer {
            tracer.line("-- session start");
        }

        loop {
            let payload = match self.reader.read_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!(target: "bridge", "input stream closed");
                    break;
                }
                Err(e) => {
                    warn!(target: "bridge", "read frame: {e:#}");
                    break;
                }
            };
            if let Some(ref tracer) = self.tracer {
                tracer.message(Direction::Inbound, &payload);
            }

            let response = handle_frame(&mut self.session, &payload);
            if let Err(e) = self.outbox.send(&response) {
                warn!(target: "bridge", "write reply: {e:#}");
                break;
            }
        }

        self.session.shutdown();
        if let Err(e) = self.outbox.send(&Response::ok_message("EOF")) {
            debug!(target: "bridge", "EOF acknowledgement not delivered: {e:#}");
        }
        if let Some(ref tracer) = self.tracer {
            tracer.line("-- session end");
        }
    }
}

//! Transport writer lock.
//!
//! The dispatch loop and the event notifier share one output stream. Every message is
//! serialized and framed before the lock is taken, so the critical section is a single
//! `write_all` + `flush` of a complete frame.

use crate::protocol::codec::{FrameError, Framing};
use crate::protocol::trace::{Direction, WireTracer};
use serde::Serialize;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

type Sink = Box<dyn Write + Send>;

/// Shared, cloneable handle to the output stream.
#[derive(Clone)]
pub struct Outbox {
    sink: Arc<Mutex<Sink>>,
    framing: Framing,
    tracer: Option<WireTracer>,
}

impl Outbox {
    pub fn new(sink: impl Write + Send + 'static, framing: Framing) -> Self {
        Self {
            sink: Arc::new(Mutex::new(Box::new(sink))),
            framing,
            tracer: None,
        }
    }

    pub fn with_tracer(mut self, tracer: Option<WireTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Serialize and write a message as one frame.
    pub fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(message)?;
        let frame = self.framing.encode(&payload)?;
        if let Some(tracer) = &self.tracer {
            tracer.message(Direction::Outbound, &payload);
        }

        // whole frame goes through a single call, poisoned sink holds no partial frame
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(&frame)?;
        sink.flush()?;
        Ok(())
    }
}

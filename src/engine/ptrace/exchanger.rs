//! Communication between target handles and the tracer thread.

use crate::engine::ptrace::tracer::Tracer;
use crate::engine::EngineError;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

type TracerTask = dyn FnOnce(&mut Tracer) + Send;

pub enum Request {
    Task(Box<TracerTask>),
    Exit,
}

pub struct ServerExchanger {
    requests: Receiver<Request>,
}

impl ServerExchanger {
    /// Wait for the next request. Return `Ok(None)` if there were no requests for `timeout`
    /// and `Err` if all clients are gone.
    pub fn next_request(&self, timeout: Duration) -> Result<Option<Request>, EngineError> {
        match self.requests.recv_timeout(timeout) {
            Ok(request) => Ok(Some(request)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::TracerGone),
        }
    }
}

pub struct ClientExchanger {
    requests: Mutex<Sender<Request>>,
}

impl ClientExchanger {
    /// Send request to the tracer and wait for response.
    pub fn request_sync<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Tracer) -> T + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        let task = Box::new(move |tracer: &mut Tracer| {
            _ = tx.send(f(tracer));
        });
        self.send(Request::Task(task))?;
        rx.recv().map_err(|_| EngineError::TracerGone)
    }

    pub fn send_exit(&self) {
        _ = self.send(Request::Exit);
    }

    fn send(&self, request: Request) -> Result<(), EngineError> {
        let requests = self.requests.lock().map_err(|_| EngineError::TracerGone)?;
        requests.send(request).map_err(|_| EngineError::TracerGone)
    }
}

pub fn exchanger() -> (ServerExchanger, ClientExchanger) {
    let (tx, rx) = mpsc::channel();
    (
        ServerExchanger { requests: rx },
        ClientExchanger {
            requests: Mutex::new(tx),
        },
    )
}

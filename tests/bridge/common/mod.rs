use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Mode {
    Line,
    Binary,
}

/// Running bridge process, documents from its output are collected in a background thread.
pub struct Bridge {
    child: Child,
    stdin: Option<ChildStdin>,
    mode: Mode,
    documents: Receiver<Value>,
    /// Notifications received while waiting for replies.
    pub notifications: Vec<Value>,
}

fn spawn_line_reader(stdout: impl Read + Send + 'static) -> Receiver<Value> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines() {
            let Ok(line) = line else { break };
            let json = line
                .strip_prefix("OUTPUT: ")
                .unwrap_or_else(|| panic!("unexpected output line: {line}"));
            if tx.send(serde_json::from_str(json).unwrap()).is_err() {
                break;
            }
        }
    });
    rx
}

fn spawn_frame_reader(mut stdout: impl Read + Send + 'static) -> Receiver<Value> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || loop {
        let mut header = [0u8; 4];
        if stdout.read_exact(&mut header).is_err() {
            break;
        }
        let mut payload = vec![0u8; u32::from_ne_bytes(header) as usize];
        if stdout.read_exact(&mut payload).is_err() {
            break;
        }
        if tx.send(serde_json::from_slice(&payload).unwrap()).is_err() {
            break;
        }
    });
    rx
}

pub fn is_notification(doc: &Value) -> bool {
    doc.get("status").is_none() && doc.get("type").is_some()
}

impl Bridge {
    pub fn start(mode: Mode) -> Self {
        Self::start_with_args(mode, &[])
    }

    pub fn start_with_args(mode: Mode, extra: &[&str]) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bs-bridge"));
        cmd.args(extra)
            .env("RUST_LOG", "off")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        if mode == Mode::Binary {
            cmd.args(["0", "1"]);
        }
        let mut child = cmd.spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        let documents = match mode {
            Mode::Line => spawn_line_reader(stdout),
            Mode::Binary => spawn_frame_reader(stdout),
        };
        Self {
            stdin: child.stdin.take(),
            child,
            mode,
            documents,
            notifications: vec![],
        }
    }

    pub fn send(&mut self, request: &Value) {
        let payload = serde_json::to_vec(request).unwrap();
        self.send_raw(&payload);
    }

    pub fn send_raw(&mut self, payload: &[u8]) {
        let stdin = self.stdin.as_mut().expect("input is closed");
        match self.mode {
            Mode::Line => {
                stdin.write_all(payload).unwrap();
                stdin.write_all(b"\n").unwrap();
            }
            Mode::Binary => {
                stdin
                    .write_all(&(payload.len() as u32).to_ne_bytes())
                    .unwrap();
                stdin.write_all(payload).unwrap();
            }
        }
        stdin.flush().unwrap();
    }

    /// Next document of any kind.
    pub fn next_document(&mut self) -> Value {
        self.documents
            .recv_timeout(TIMEOUT)
            .expect("no document from the bridge")
    }

    /// Next status reply, notifications received before it are saved.
    pub fn reply(&mut self) -> Value {
        loop {
            let doc = self.next_document();
            if is_notification(&doc) {
                self.notifications.push(doc);
                continue;
            }
            return doc;
        }
    }

    /// Send a request and wait for its reply.
    pub fn request(&mut self, request: Value) -> Value {
        self.send(&request);
        self.reply()
    }

    /// Wait for a notification matching `predicate`, saved ones are checked first.
    pub fn wait_notification(&mut self, predicate: impl Fn(&Value) -> bool) -> Value {
        if let Some(idx) = self.notifications.iter().position(&predicate) {
            return self.notifications.remove(idx);
        }
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let doc = self
                .documents
                .recv_timeout(left)
                .expect("notification not received");
            if is_notification(&doc) && predicate(&doc) {
                return doc;
            }
            if is_notification(&doc) {
                self.notifications.push(doc);
            }
        }
    }

    /// Close the input stream, collect everything until the bridge exits.
    pub fn finish(mut self) -> (Vec<Value>, ExitStatus) {
        drop(self.stdin.take());
        let mut rest = vec![];
        while let Ok(doc) = self.documents.recv_timeout(TIMEOUT) {
            rest.push(doc);
        }
        let status = self.child.wait().unwrap();
        (rest, status)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        _ = self.child.kill();
        _ = self.child.wait();
    }
}

pub fn state_is(code: u64) -> impl Fn(&Value) -> bool {
    move |doc| doc["type"] == "state" && doc["payload"]["inferior_state"] == code
}

pub fn stopped_with(reason: &'static str) -> impl Fn(&Value) -> bool {
    move |doc| doc["type"] == "stopped" && doc["payload"]["reason"] == reason
}

//! Wire level: message shapes, framing and the shared output sink.

pub mod codec;
pub mod trace;
pub mod writer;

pub use codec::{FrameError, FrameReader, Framing};
pub use writer::Outbox;

use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Status document, always carries a `status` field.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusReply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Typed envelope, carries `type` and `payload` fields.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypedReply {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

/// Reply to a command.
///
/// Two shapes are on the wire: a status document and a typed envelope used by data-view
/// commands. The caller distinguishes them by presence of `status` or `type`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Status(StatusReply),
    Typed(TypedReply),
}

impl Response {
    fn status(status: Status, message: Option<String>) -> Self {
        Response::Status(StatusReply {
            status,
            message,
            extra: Map::new(),
            id: None,
        })
    }

    pub fn ok() -> Self {
        Self::status(Status::Ok, None)
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Self::status(Status::Ok, Some(message.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::status(Status::Error, Some(message.into()))
    }

    pub fn typed(kind: &'static str, payload: impl Serialize) -> Self {
        Response::Typed(TypedReply {
            kind,
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            id: None,
        })
    }

    /// Add an extra field into a status document, typed envelopes are left untouched.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Response::Status(ref mut reply) = self {
            reply.extra.insert(
                key.to_string(),
                serde_json::to_value(value).unwrap_or(Value::Null),
            );
        }
        self
    }

    /// Attach a caller correlation id.
    pub fn with_id(mut self, correlation: Option<Value>) -> Self {
        match self {
            Response::Status(ref mut reply) => reply.id = correlation,
            Response::Typed(ref mut reply) => reply.id = correlation,
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        !matches!(
            self,
            Response::Status(StatusReply {
                status: Status::Error,
                ..
            })
        )
    }
}

/// Unsolicited engine-originated message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Notification {
    State(StatePayload),
    Stopped(StoppedPayload),
    Detached,
    Stdout(OutputPayload),
    Stderr(OutputPayload),
    ModuleLoaded(ModulesPayload),
    ModuleUnloaded(ModulesPayload),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatePayload {
    pub inferior_state: u32,
    pub state_desc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedPayload {
    pub reason: String,
    pub thread_id: u64,
    pub pc: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OutputPayload {
    /// Hex encoded bytes.
    pub output: String,
}

impl OutputPayload {
    pub fn from_bytes(data: &[u8]) -> Self {
        Self {
            output: hex(data),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModulesPayload {
    pub modules: Vec<ModuleImage>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleImage {
    pub directory: Option<String>,
    pub file: Option<String>,
    pub load_address: u64,
    pub file_address: u64,
    pub slide: u64,
}

/// Lower-case hex representation without separators.
pub fn hex(data: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        _ = write!(out, "{b:02x}");
    }
    out
}

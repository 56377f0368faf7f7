//! Decrypted agent messages.
//!
//! Every post-handshake plaintext is a JSON object with a string `type`
//! field. Known kinds get typed bodies; anything else is kept as raw JSON
//! so an application-registered handler can still claim it by tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Checkin,
    TaskResult,
    Error,
    /// Any tag without a built-in meaning.
    Other(String),
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "checkin" => Self::Checkin,
            "task_result" => Self::TaskResult,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Checkin => "checkin",
            Self::TaskResult => "task_result",
            Self::Error => "error",
            Self::Other(tag) => tag,
        }
    }
}

/// One decoded inbound message: its kind plus the full JSON object,
/// `type` field included.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub kind: MessageKind,
    pub body: Value,
}

impl Inbound {
    pub fn parse(plaintext: &[u8]) -> Result<Self, MessageError> {
        let body: Value = serde_json::from_slice(plaintext).map_err(|_| MessageError::NotJson)?;
        let tag = body
            .as_object()
            .ok_or(MessageError::NotAnObject)?
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?;
        Ok(Self {
            kind: MessageKind::from_tag(tag),
            body,
        })
    }

    pub fn tag(&self) -> &str {
        self.kind.tag()
    }

    /// Deserialize the body into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        T::deserialize(&self.body).map_err(|_| MessageError::InvalidFields)
    }
}

// ── Typed bodies ──────────────────────────────────────────────────────────────

/// `checkin`. Fields are optional on the wire so a partial checkin can be
/// answered with a precise error instead of a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Checkin {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub os: Option<String>,
}

/// A checkin with all three attributes present and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub username: String,
    pub os: String,
}

impl Checkin {
    pub fn validate(self) -> Option<AgentInfo> {
        let non_empty = |s: Option<String>| s.filter(|v| !v.is_empty());
        Some(AgentInfo {
            hostname: non_empty(self.hostname)?,
            username: non_empty(self.username)?,
            os: non_empty(self.os)?,
        })
    }
}

/// `task_result`. `result` may be any JSON value except null.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskResult {
    pub task_id: Option<String>,
    #[serde(default)]
    pub result: Value,
}

/// `error`, an agent reporting a failure on its side.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentError {
    pub error_type: Option<String>,
    pub message: Option<String>,
}

// ── Replies ───────────────────────────────────────────────────────────────────

pub mod reply {
    use super::*;

    pub const MISSING_CHECKIN_INFO: &str = "Missing hostname, username, or os info";
    pub const MISSING_TASK_RESULT: &str = "Missing task_id or result";
    pub const INVALID_ERROR_DATA: &str = "Invalid error data";
    pub const INVALID_FORMAT: &str = "Invalid data format";
    pub const SESSION_NOT_FOUND: &str = "Session not found";
    pub const DECRYPTION_FAILED: &str = "Decryption failed";
    pub const INVALID_MESSAGE: &str = "Invalid message";

    pub fn error(message: &str) -> Value {
        json!({ "type": "error", "message": message })
    }

    pub fn unknown_type(tag: &str) -> Value {
        error(&format!("Unknown message type: {tag}"))
    }

    pub fn checkin_response(session_id: &str) -> Value {
        json!({ "type": "checkin_response", "status": "success", "session_id": session_id })
    }

    pub fn task_result_response(task_id: &str) -> Value {
        json!({ "type": "task_result_response", "status": "received", "task_id": task_id })
    }

    pub fn error_response() -> Value {
        json!({ "type": "error_response", "status": "received" })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("plaintext is not valid JSON")]
    NotJson,

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no string `type` field")]
    MissingType,

    #[error("message fields do not match its type")]
    InvalidFields,
}

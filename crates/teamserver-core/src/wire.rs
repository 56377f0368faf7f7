//! Wire types shared by the connection engine, the event bus and clients.
//!
//! Handshake frames travel as plaintext JSON text messages. After the
//! handshake every frame is a base64 `CryptoSession` envelope whose
//! plaintext is one of the JSON objects in `message`.
//!
//! Lifecycle events travel on the event bus as `(topic, JSON payload)`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ── Handshake ─────────────────────────────────────────────────────────────────

/// Unencrypted frames exchanged before the session key exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeFrame {
    /// Sent by both sides. `public_key` is SubjectPublicKeyInfo PEM.
    KeyExchange { public_key: String },
    /// Server to client, once the session exists.
    SessionEstablished { session_id: String },
}

impl HandshakeFrame {
    pub fn to_json(&self) -> String {
        // Two string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ── Event bus topics ──────────────────────────────────────────────────────────

pub mod topics {
    pub const CLIENT_CONNECTED: &str = "client_connected";
    pub const CLIENT_DISCONNECTED: &str = "client_disconnected";
}

/// Payload of `client_connected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConnected {
    pub session_id: String,
    pub address: String,
    /// Unix milliseconds.
    pub timestamp: u64,
}

/// Payload of `client_disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnected {
    pub session_id: String,
    pub address: String,
    pub reason: DisconnectReason,
    /// Unix milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    TransportClosed,
    Expired,
    AuthenticationFailures,
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportClosed => "transport_closed",
            Self::Expired => "expired",
            Self::AuthenticationFailures => "authentication_failures",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock time in unix milliseconds, for event payloads.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

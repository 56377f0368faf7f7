//! One agent connection, from upgrade to close.
//!
//! ```text
//! Connecting → KeyExchange → SessionEstablished → Active → Closing → Closed
//! ```
//!
//! The session is created only once the key exchange succeeded, and a
//! `SessionGuard` takes ownership of it in the same step. Every exit path
//! after that, including task cancellation, drops the guard, which removes
//! the session and publishes `client_disconnected`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use teamserver_core::crypto::{CryptoError, CryptoSession, Role};
use teamserver_core::message::{reply, Inbound};
use teamserver_core::wire::{
    topics, unix_millis, ClientConnected, ClientDisconnected, DisconnectReason, HandshakeFrame,
};
use teamserver_services::audit::{self, AuditRecord};
use teamserver_services::auth::Principal;
use teamserver_services::session::generate_session_id;
use teamserver_services::SessionLink;

use super::EngineContext;

const EXPECTED_KEY_EXCHANGE: &str = "Expected key_exchange";
const INVALID_PUBLIC_KEY: &str = "Invalid public key";
const INTERNAL_ERROR: &str = "Internal error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    KeyExchange,
    SessionEstablished,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::KeyExchange => "key_exchange",
            Self::SessionEstablished => "session_established",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("invalid peer key: {0}")]
    InvalidPeerKey(#[source] CryptoError),
    #[error("no key_exchange within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("transport closed")]
    TransportClosed,
    #[error("{0} consecutive frames failed authentication")]
    AuthenticationFailures(u32),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Entry point for an upgraded socket. Never returns an error: every
/// outcome is logged here.
pub async fn run(
    socket: WebSocket,
    peer: SocketAddr,
    principal: Principal,
    ctx: Arc<EngineContext>,
    shutdown: CancellationToken,
) {
    let mut conn = Connection {
        socket,
        peer,
        ctx,
        state: ConnectionState::Connecting,
    };
    tracing::debug!(peer = %peer, principal = %principal.name, "connection accepted");

    match conn.drive(&principal, &shutdown).await {
        Ok(()) | Err(ConnectionError::TransportClosed) => {}
        Err(e @ ConnectionError::AuthenticationFailures(_)) => {
            tracing::warn!(peer = %peer, error = %e, "dropping connection");
        }
        Err(e) => tracing::warn!(peer = %peer, state = conn.state.as_str(), error = %e, "connection failed"),
    }

    conn.transition(ConnectionState::Closing);
    let _ = conn.socket.send(Message::Close(None)).await;
    conn.transition(ConnectionState::Closed);
}

struct Connection {
    socket: WebSocket,
    peer: SocketAddr,
    ctx: Arc<EngineContext>,
    state: ConnectionState,
}

impl Connection {
    fn transition(&mut self, next: ConnectionState) {
        debug_assert!(next >= self.state, "state went backwards");
        tracing::trace!(peer = %self.peer, from = self.state.as_str(), to = next.as_str(), "connection state");
        self.state = next;
    }

    async fn drive(&mut self, principal: &Principal, shutdown: &CancellationToken) -> Result<(), ConnectionError> {
        // ── Handshake ──
        self.transition(ConnectionState::KeyExchange);
        let mut crypto = CryptoSession::generate(Role::Server, self.ctx.settings.suite)
            .map_err(|e| ConnectionError::Internal(e.to_string()))?;
        self.send_text(
            HandshakeFrame::KeyExchange {
                public_key: crypto.public_key().to_string(),
            }
            .to_json(),
        )
        .await?;

        let peer_key = match self.await_key_exchange(shutdown).await {
            Ok(key) => key,
            Err(e @ ConnectionError::ProtocolViolation(_)) => {
                self.send_plain_error(EXPECTED_KEY_EXCHANGE).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        if let Err(e) = crypto.complete_exchange(&peer_key) {
            self.send_plain_error(INVALID_PUBLIC_KEY).await;
            return Err(ConnectionError::InvalidPeerKey(e));
        }

        // ── Session ──
        self.transition(ConnectionState::SessionEstablished);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(self.ctx.settings.outbound_queue);
        let closed = CancellationToken::new();
        let session_id = generate_session_id();
        self.ctx
            .sessions
            .create(
                session_id.clone(),
                self.peer,
                crypto,
                SessionLink::new(outbound_tx, closed.clone()),
            )
            .map_err(|e| ConnectionError::Internal(e.to_string()))?;
        let mut guard = SessionGuard {
            ctx: Arc::clone(&self.ctx),
            session_id: session_id.clone(),
            address: self.peer,
            reason: DisconnectReason::TransportClosed,
        };
        let crypto = self
            .ctx
            .sessions
            .crypto(&session_id)
            .ok_or_else(|| ConnectionError::Internal("session vanished after create".into()))?;

        self.send_text(
            HandshakeFrame::SessionEstablished {
                session_id: session_id.clone(),
            }
            .to_json(),
        )
        .await?;

        self.ctx.bus.publish(
            topics::CLIENT_CONNECTED,
            &ClientConnected {
                session_id: session_id.clone(),
                address: self.peer.to_string(),
                timestamp: unix_millis(),
            },
        );
        audit::record(
            self.ctx.audit.as_ref(),
            AuditRecord::created(&session_id, &self.peer.to_string()),
        );
        tracing::info!(
            session_id = %session_id,
            peer = %self.peer,
            principal = %principal.name,
            "session established"
        );

        // ── Active ──
        self.transition(ConnectionState::Active);
        let mut failures = 0u32;
        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    guard.reason = DisconnectReason::Shutdown;
                    break Ok(());
                }
                // The sweeper already removed the session and announced it.
                _ = closed.cancelled() => {
                    tracing::info!(session_id = %session_id, "session expired, closing transport");
                    break Ok(());
                }
                Some(frame) = outbound_rx.recv() => {
                    if let Err(e) = self.send_text(frame).await {
                        break Err(e);
                    }
                }
                incoming = self.socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match self.handle_frame(&session_id, &crypto, text.as_str(), &mut failures).await {
                            Ok(()) => {}
                            Err(e @ ConnectionError::AuthenticationFailures(_)) => {
                                guard.reason = DisconnectReason::AuthenticationFailures;
                                break Err(e);
                            }
                            Err(e) => break Err(e),
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        if let Err(e) = self.reply(&crypto, &reply::error(reply::INVALID_MESSAGE)).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Err(ConnectionError::TransportClosed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(session_id = %session_id, error = %e, "transport error");
                        break Err(ConnectionError::TransportClosed);
                    }
                },
            }
        };

        drop(guard);
        result
    }

    /// Wait for the peer's `key_exchange`, bounded by the handshake timeout.
    async fn await_key_exchange(&mut self, shutdown: &CancellationToken) -> Result<String, ConnectionError> {
        let limit = self.ctx.settings.handshake_timeout;
        let text = tokio::select! {
            _ = shutdown.cancelled() => return Err(ConnectionError::TransportClosed),
            received = tokio::time::timeout(limit, self.next_text()) => {
                received.map_err(|_| ConnectionError::HandshakeTimeout(limit))??
            }
        };
        parse_key_exchange(&text)
    }

    /// Next text frame, skipping control frames.
    async fn next_text(&mut self) -> Result<String, ConnectionError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Binary(_))) => {
                    return Err(ConnectionError::ProtocolViolation("binary frame during handshake"))
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    return Err(ConnectionError::TransportClosed)
                }
            }
        }
    }

    /// Decrypt, dispatch and answer one agent frame. Only transport loss
    /// and repeated authentication failure end the connection.
    async fn handle_frame(
        &mut self,
        session_id: &str,
        crypto: &Mutex<CryptoSession>,
        text: &str,
        failures: &mut u32,
    ) -> Result<(), ConnectionError> {
        let decrypted = crypto.lock().await.decrypt(text.trim());
        let plaintext = match decrypted {
            Ok(plaintext) => {
                *failures = 0;
                plaintext
            }
            Err(e) => {
                if matches!(e, CryptoError::AuthenticationFailed | CryptoError::Replay) {
                    *failures += 1;
                }
                tracing::warn!(session_id, error = %e, failures = *failures, "undecryptable frame");
                self.reply(crypto, &reply::error(reply::DECRYPTION_FAILED)).await?;
                if *failures >= self.ctx.settings.max_auth_failures {
                    return Err(ConnectionError::AuthenticationFailures(*failures));
                }
                return Ok(());
            }
        };

        self.ctx.sessions.touch(session_id);

        let message = match Inbound::parse(&plaintext) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(session_id, error = %e, "unparseable message");
                return self.reply(crypto, &reply::error(reply::INVALID_MESSAGE)).await;
            }
        };

        let Some(handler) = self.ctx.handlers.get(message.tag()) else {
            tracing::warn!(session_id, message_type = message.tag(), "no handler for message type");
            return self.reply(crypto, &reply::unknown_type(message.tag())).await;
        };

        tracing::debug!(session_id, message_type = message.tag(), "dispatching");
        match handler.handle(&message, session_id).await {
            Some(response) => self.reply(crypto, &response).await,
            None => Ok(()),
        }
    }

    /// Encrypt and send. Falls back to a plaintext error if the session
    /// cannot encrypt.
    async fn reply(&mut self, crypto: &Mutex<CryptoSession>, message: &Value) -> Result<(), ConnectionError> {
        let encrypted = crypto.lock().await.encrypt(message.to_string().as_bytes());
        match encrypted {
            Ok(frame) => self.send_text(frame).await,
            Err(e) => {
                tracing::error!(peer = %self.peer, error = %e, "failed to encrypt reply");
                self.send_text(reply::error(INTERNAL_ERROR).to_string()).await
            }
        }
    }

    async fn send_plain_error(&mut self, message: &str) {
        let _ = self.send_text(reply::error(message).to_string()).await;
    }

    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| ConnectionError::TransportClosed)
    }
}

/// Only a well-formed `key_exchange` is acceptable before the session exists.
fn parse_key_exchange(text: &str) -> Result<String, ConnectionError> {
    match serde_json::from_str::<HandshakeFrame>(text) {
        Ok(HandshakeFrame::KeyExchange { public_key }) if !public_key.trim().is_empty() => Ok(public_key),
        Ok(_) => Err(ConnectionError::ProtocolViolation("expected key_exchange")),
        Err(_) => Err(ConnectionError::ProtocolViolation("malformed handshake frame")),
    }
}

// ── Cleanup ───────────────────────────────────────────────────────────────────

/// Owns a registered session for the lifetime of its connection task.
struct SessionGuard {
    ctx: Arc<EngineContext>,
    session_id: String,
    address: SocketAddr,
    reason: DisconnectReason,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // After the last handler ran, so nothing can refill it.
        self.ctx.task_results.remove_session(&self.session_id);

        // Gone already means the sweeper took it and announced it.
        let Some(session) = self.ctx.sessions.remove(&self.session_id) else {
            tracing::debug!(session_id = %self.session_id, "session already removed");
            return;
        };
        if let Ok(mut crypto) = session.crypto.try_lock() {
            crypto.invalidate();
        }

        self.ctx.bus.publish(
            topics::CLIENT_DISCONNECTED,
            &ClientDisconnected {
                session_id: self.session_id.clone(),
                address: self.address.to_string(),
                reason: self.reason,
                timestamp: unix_millis(),
            },
        );
        audit::record(
            self.ctx.audit.as_ref(),
            AuditRecord::closed(&self.session_id, self.reason),
        );
        tracing::info!(session_id = %self.session_id, reason = %self.reason, "session closed");
    }
}

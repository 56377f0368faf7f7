//! Session registry: tracks every agent whose handshake completed.
//!
//! A session enters the registry only after key exchange succeeded and
//! leaves it exactly once: on transport closure, expiry, or repeated
//! authentication failure. Whoever's `remove` returns the session owns
//! the disconnect notification.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use teamserver_core::crypto::CryptoSession;
use teamserver_core::message::AgentInfo;
use teamserver_core::wire::unix_millis;

/// Server-generated session identifier: 32 random bytes, hex encoded.
pub type SessionId = String;

pub fn generate_session_id() -> SessionId {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// The registry's handle on a session's transport.
///
/// The socket itself is owned by the connection task. Other tasks reach it
/// only through this link: a bounded queue of already-encrypted frames, and
/// a token that asks the connection task to close.
#[derive(Debug, Clone)]
pub struct SessionLink {
    outbound: mpsc::Sender<String>,
    closed: CancellationToken,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("session transport is closed")]
    Closed,
    #[error("session outbound queue is full")]
    Full,
}

impl SessionLink {
    pub fn new(outbound: mpsc::Sender<String>, closed: CancellationToken) -> Self {
        Self { outbound, closed }
    }

    /// Queue an encrypted frame without waiting.
    pub fn send(&self, frame: String) -> Result<(), LinkError> {
        if self.closed.is_cancelled() {
            return Err(LinkError::Closed);
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    /// Ask the owning connection task to shut the transport.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Mutable metadata: where the agent is and what it told us about itself.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub address: SocketAddr,
    /// Unix milliseconds.
    pub connected_at: u64,
    pub agent: Option<AgentInfo>,
    /// Unix milliseconds of the latest successful checkin.
    pub last_checkin: Option<u64>,
}

pub struct Session {
    pub id: SessionId,
    pub meta: SessionMeta,
    /// Locked by the connection task per frame and by broadcast.
    pub crypto: Arc<Mutex<CryptoSession>>,
    pub link: SessionLink,
    pub created_at: Instant,
    last_active: Instant,
}

impl Session {
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    pub fn info(&self) -> SessionInfo {
        let now = Instant::now();
        SessionInfo {
            id: self.id.clone(),
            address: self.meta.address.to_string(),
            hostname: self.meta.agent.as_ref().map(|a| a.hostname.clone()),
            username: self.meta.agent.as_ref().map(|a| a.username.clone()),
            os: self.meta.agent.as_ref().map(|a| a.os.clone()),
            connected_at: self.meta.connected_at,
            last_checkin: self.meta.last_checkin,
            idle_secs: now.saturating_duration_since(self.last_active).as_secs(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("last_active", &self.last_active)
            .finish_non_exhaustive()
    }
}

/// Read-only snapshot of a session, safe to hand to the status API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub address: String,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub os: Option<String>,
    pub connected_at: u64,
    pub last_checkin: Option<u64>,
    pub idle_secs: u64,
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session id {0} already exists")]
    DuplicateId(SessionId),
}

/// Concurrent-safe table of active sessions.
///
/// Every operation holds at most one shard lock, and never across an
/// `.await` or a send.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &self,
        id: SessionId,
        address: SocketAddr,
        crypto: CryptoSession,
        link: SessionLink,
    ) -> Result<SessionInfo, RegistryError> {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let now = Instant::now();
                let session = Session {
                    id,
                    meta: SessionMeta {
                        address,
                        connected_at: unix_millis(),
                        agent: None,
                        last_checkin: None,
                    },
                    crypto: Arc::new(Mutex::new(crypto)),
                    link,
                    created_at: now,
                    last_active: now,
                };
                let info = session.info();
                slot.insert(session);
                Ok(info)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.get(id).map(|s| s.info())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn crypto(&self, id: &str) -> Option<Arc<Mutex<CryptoSession>>> {
        self.sessions.get(id).map(|s| Arc::clone(&s.crypto))
    }

    pub fn last_active(&self, id: &str) -> Option<Instant> {
        self.sessions.get(id).map(|s| s.last_active)
    }

    /// Mark activity. Never moves `last_active` backwards.
    pub fn touch(&self, id: &str) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            let now = Instant::now();
            if now > s.last_active {
                s.last_active = now;
            }
        }
    }

    /// Record what the agent reported at checkin. False if the session is gone.
    pub fn record_checkin(&self, id: &str, agent: AgentInfo) -> bool {
        match self.sessions.get_mut(id) {
            Some(mut s) => {
                s.meta.agent = Some(agent);
                s.meta.last_checkin = Some(unix_millis());
                true
            }
            None => false,
        }
    }

    /// Remove a session. Returns it only to the first caller.
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    /// Remove every session idle for longer than `timeout`, signal each
    /// one's transport to close, and return their final snapshots.
    ///
    /// Each decision is made under the session's shard lock, so a session
    /// touched concurrently is either kept or gone, never half-swept.
    pub fn sweep_expired(&self, timeout: Duration) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.sessions.retain(|_, s| {
            if now.saturating_duration_since(s.last_active) > timeout {
                s.link.close();
                expired.push(s.info());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut all: Vec<_> = self.sessions.iter().map(|s| s.info()).collect();
        all.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Encrypt `message` separately for every session and queue it.
    ///
    /// The session set is copied out first; the per-session crypto lock
    /// and the send happen with no registry lock held. A failing session
    /// is logged and skipped. Returns how many sessions accepted the frame.
    pub async fn broadcast(&self, message: &Value) -> usize {
        let plaintext = message.to_string();
        let targets: Vec<(SessionId, Arc<Mutex<CryptoSession>>, SessionLink)> = self
            .sessions
            .iter()
            .map(|s| (s.id.clone(), Arc::clone(&s.crypto), s.link.clone()))
            .collect();

        tracing::debug!(sessions = targets.len(), "broadcasting message");

        let mut delivered = 0;
        for (id, crypto, link) in targets {
            let frame = match crypto.lock().await.encrypt(plaintext.as_bytes()) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "broadcast encrypt failed");
                    continue;
                }
            };
            match link.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "broadcast send failed"),
            }
        }
        delivered
    }
}

//! Teamserver integration test harness.
//!
//! Every test starts an in-process `TeamServer` on loopback with
//! OS-assigned ports and drives it with a real WebSocket agent:
//!
//!   cargo test --test integration
//!
//! Tests never share a server.

mod bus;
mod failures;
mod handshake;
mod messaging;
mod sessions;
mod status;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use teamserver_core::crypto::{CipherSuite, CryptoSession, Role};
use teamserver_core::wire::HandshakeFrame;
use teamserver_core::TeamServerConfig;
use teamserverd::{FnTopicHandler, TeamServer};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long any single expected frame may take to arrive.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ── Harness ───────────────────────────────────────────────────────────────────

/// Loopback, OS-assigned ports, secure bus with a generated key.
pub fn test_config() -> TeamServerConfig {
    TeamServerConfig::ephemeral()
}

pub async fn start(config: TeamServerConfig) -> TeamServer {
    TeamServer::start(config).await.expect("teamserver should start")
}

/// Start a server that forwards every payload published on `topic` to the
/// returned channel.
pub async fn start_watching(
    config: TeamServerConfig,
    topic: &str,
) -> (TeamServer, tokio::sync::mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let server = TeamServer::builder(config)
        .subscribe(
            topic,
            std::sync::Arc::new(FnTopicHandler(move |payload: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                }
            })),
        )
        .start()
        .await
        .expect("teamserver should start");
    (server, rx)
}

pub async fn open_ws(addr: SocketAddr, bearer: Option<&str>) -> Result<Ws> {
    let mut request = format!("ws://{addr}/").into_client_request()?;
    if let Some(token) = bearer {
        request
            .headers_mut()
            .insert(AUTHORIZATION, format!("Bearer {token}").parse()?);
    }
    let (ws, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Next text frame, skipping control frames. `None` once the server
/// closed the connection.
pub async fn next_text(ws: &mut Ws) -> Result<Option<String>> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .context("timed out waiting for a frame")?;
        match frame {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return Ok(None),
            Some(Ok(_)) => continue,
        }
    }
}

/// An agent that completed the handshake.
pub struct Agent {
    pub ws: Ws,
    pub crypto: CryptoSession,
    pub session_id: String,
}

impl Agent {
    pub async fn connect(server: &TeamServer) -> Result<Self> {
        Self::connect_with(server.local_addr(), CipherSuite::Aes256Gcm, None).await
    }

    pub async fn connect_with(addr: SocketAddr, suite: CipherSuite, bearer: Option<&str>) -> Result<Self> {
        let mut ws = open_ws(addr, bearer).await?;
        let mut crypto = CryptoSession::generate(Role::Client, suite)?;

        ws.send(Message::text(
            HandshakeFrame::KeyExchange {
                public_key: crypto.public_key().to_string(),
            }
            .to_json(),
        ))
        .await?;

        let server_key = match parse_handshake(next_text(&mut ws).await?)? {
            HandshakeFrame::KeyExchange { public_key } => public_key,
            other => bail!("expected key_exchange, got {other:?}"),
        };
        crypto.complete_exchange(&server_key)?;

        let session_id = match parse_handshake(next_text(&mut ws).await?)? {
            HandshakeFrame::SessionEstablished { session_id } => session_id,
            other => bail!("expected session_established, got {other:?}"),
        };

        Ok(Self {
            ws,
            crypto,
            session_id,
        })
    }

    pub async fn send(&mut self, message: &Value) -> Result<()> {
        let frame = self.crypto.encrypt(message.to_string().as_bytes())?;
        self.send_raw(frame).await
    }

    pub async fn send_raw(&mut self, frame: String) -> Result<()> {
        self.ws.send(Message::text(frame)).await?;
        Ok(())
    }

    /// Next decrypted message, or `None` if the server closed.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        let Some(frame) = next_text(&mut self.ws).await? else {
            return Ok(None);
        };
        let plaintext = self.crypto.decrypt(&frame)?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    pub async fn request(&mut self, message: Value) -> Result<Value> {
        self.send(&message).await?;
        self.recv().await?.context("server closed before replying")
    }
}

fn parse_handshake(text: Option<String>) -> Result<HandshakeFrame> {
    let text = text.context("server closed during handshake")?;
    serde_json::from_str(&text).with_context(|| format!("not a handshake frame: {text}"))
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub async fn recv_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for bus event")
        .expect("bus event channel closed")
}

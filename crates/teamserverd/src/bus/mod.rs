//! Event bus: in-process and remote publish/subscribe for lifecycle
//! events.
//!
//! Publishing never blocks and never fails the caller:
//!   - local handlers receive each publish exactly once through a bounded
//!     queue drained by `run`
//!   - remote subscribers (connected to the PUB endpoint) receive the
//!     topics they asked for
//!   - remote publishers (connected to the SUB endpoint) feed the same
//!     queue as local publishes
//!
//! There is no persistence and no delivery guarantee: a full queue or a
//! lagging subscriber drops messages with a warning.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use teamserver_bus::link::{parse_control, BusLink};
use teamserver_core::config::BusConfig;
use teamserver_core::crypto::curve::StaticKeypair;
use teamserver_services::HandlerRegistry;

use crate::running::RunningGuard;

pub use teamserver_bus::{client, link, BusError, BusPublisher, BusSecurity, BusSubscriber};

/// Depth of the queue feeding local handlers.
const INBOUND_QUEUE: usize = 1024;
/// Per-subscriber backlog before a slow remote subscriber starts losing messages.
const REMOTE_BACKLOG: usize = 1024;

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: Bytes,
    pub payload: Bytes,
}

// ── Handlers ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, payload: Value);
}

/// Topic → handler. Topics match exactly, byte for byte.
pub type TopicHandlers = HandlerRegistry<Vec<u8>, dyn TopicHandler>;

/// Adapts an async closure into a `TopicHandler`.
pub struct FnTopicHandler<F>(pub F);

#[async_trait]
impl<F, Fut> TopicHandler for FnTopicHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = ()> + Send,
{
    async fn handle(&self, payload: Value) {
        (self.0)(payload).await
    }
}

// ── Publishing ────────────────────────────────────────────────────────────────

/// Cheap, cloneable publishing side of the bus.
#[derive(Clone)]
pub struct BusHandle {
    local: mpsc::Sender<BusMessage>,
    remote: broadcast::Sender<BusMessage>,
}

impl BusHandle {
    /// Serialize `payload` and publish it on `topic`. Errors are logged.
    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        match serde_json::to_vec(payload) {
            Ok(json) => self.publish_raw(topic.as_bytes(), json),
            Err(e) => tracing::warn!(topic, error = %e, "failed to encode bus payload"),
        }
    }

    pub fn publish_raw(&self, topic: &[u8], payload: Vec<u8>) {
        let message = BusMessage {
            topic: Bytes::copy_from_slice(topic),
            payload: Bytes::from(payload),
        };
        // No remote subscribers is the common case, not an error.
        let _ = self.remote.send(message.clone());
        if let Err(e) = self.local.try_send(message) {
            tracing::warn!(
                topic = %String::from_utf8_lossy(topic),
                error = %e,
                "local bus queue rejected message"
            );
        }
    }
}

// ── Bus ───────────────────────────────────────────────────────────────────────

pub struct EventBus {
    handlers: TopicHandlers,
    handle: BusHandle,
    inbound_tx: mpsc::Sender<BusMessage>,
    inbound_rx: mpsc::Receiver<BusMessage>,
    pub_listener: TcpListener,
    sub_listener: TcpListener,
    keypair: Option<Arc<StaticKeypair>>,
    handshake_timeout: Duration,
    running: Arc<AtomicBool>,
}

impl EventBus {
    /// Bind the PUB and SUB endpoints. `keypair` is `Some` exactly when
    /// the bus runs in secure mode.
    pub async fn bind(config: &BusConfig, keypair: Option<StaticKeypair>) -> Result<Self, BusError> {
        let pub_listener = TcpListener::bind(config.pub_addr()).await?;
        let sub_listener = TcpListener::bind(config.sub_addr()).await?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (remote, _) = broadcast::channel(REMOTE_BACKLOG);

        match &keypair {
            Some(kp) => tracing::info!(public_key = %kp.public_hex(), "event bus secured with Noise_XX"),
            None => tracing::warn!("event bus is running WITHOUT authentication or encryption"),
        }
        tracing::info!(
            publish = %pub_listener.local_addr()?,
            subscribe = %sub_listener.local_addr()?,
            "event bus bound"
        );

        Ok(Self {
            handlers: TopicHandlers::new(),
            handle: BusHandle {
                local: inbound_tx.clone(),
                remote,
            },
            inbound_tx,
            inbound_rx,
            pub_listener,
            sub_listener,
            keypair: keypair.map(Arc::new),
            handshake_timeout: config.handshake_timeout(),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Register `handler` for `topic`. Last registration wins.
    pub fn subscribe(&mut self, topic: &str, handler: Arc<dyn TopicHandler>) {
        if self
            .handlers
            .register(topic.as_bytes().to_vec(), handler)
            .is_some()
        {
            tracing::debug!(topic, "replaced bus subscription");
        }
    }

    pub fn publish<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) {
        self.handle.publish(topic, payload);
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    /// Where remote subscribers connect.
    pub fn pub_addr(&self) -> std::io::Result<SocketAddr> {
        self.pub_listener.local_addr()
    }

    /// Where remote publishers connect.
    pub fn sub_addr(&self) -> std::io::Result<SocketAddr> {
        self.sub_listener.local_addr()
    }

    pub fn public_key(&self) -> Option<[u8; 32]> {
        self.keypair.as_ref().map(|kp| kp.public)
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serve until `shutdown`. Remote links are dropped without flushing.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let Self {
            handlers,
            handle,
            inbound_tx,
            mut inbound_rx,
            pub_listener,
            sub_listener,
            keypair,
            handshake_timeout,
            running,
        } = self;

        let _running = RunningGuard::set(&running);
        let mut links = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                accepted = pub_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let rx = handle.remote.subscribe();
                        links.spawn(serve_subscriber(
                            stream,
                            peer,
                            rx,
                            keypair.clone(),
                            handshake_timeout,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "bus PUB accept failed"),
                },

                accepted = sub_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        links.spawn(serve_publisher(
                            stream,
                            peer,
                            inbound_tx.clone(),
                            keypair.clone(),
                            handshake_timeout,
                        ));
                    }
                    Err(e) => tracing::warn!(error = %e, "bus SUB accept failed"),
                },

                Some(message) = inbound_rx.recv() => {
                    dispatch(&handlers, message).await;
                }

                // Reap finished links so the set does not grow unbounded.
                Some(_) = links.join_next(), if !links.is_empty() => {}
            }
        }

        links.abort_all();
        while links.join_next().await.is_some() {}
        tracing::info!("event bus stopped");
        Ok(())
    }
}

async fn dispatch(handlers: &TopicHandlers, message: BusMessage) {
    let Some(handler) = handlers.get(&message.topic[..]) else {
        tracing::trace!(
            topic = %String::from_utf8_lossy(&message.topic),
            "no subscriber for topic"
        );
        return;
    };
    match serde_json::from_slice::<Value>(&message.payload) {
        Ok(payload) => {
            // A panicking subscriber loses its message, not the bus.
            if AssertUnwindSafe(handler.handle(payload)).catch_unwind().await.is_err() {
                tracing::error!(
                    topic = %String::from_utf8_lossy(&message.topic),
                    "bus subscriber panicked"
                );
            }
        }
        Err(e) => tracing::warn!(
            topic = %String::from_utf8_lossy(&message.topic),
            error = %e,
            "dropping bus message with invalid JSON payload"
        ),
    }
}

// ── Remote endpoints ──────────────────────────────────────────────────────────

/// Finish the link handshake within `limit`. A silent or broken peer is
/// logged and dropped.
async fn accept_link(
    stream: TcpStream,
    peer: SocketAddr,
    keypair: Option<Arc<StaticKeypair>>,
    limit: Duration,
    role: &'static str,
) -> Option<BusLink> {
    match tokio::time::timeout(limit, BusLink::accept(stream, keypair.as_deref())).await {
        Ok(Ok(link)) => Some(link),
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, role, error = %e, "bus link handshake failed");
            None
        }
        Err(_) => {
            tracing::warn!(peer = %peer, role, ?limit, "bus link handshake timed out");
            None
        }
    }
}

/// A remote subscriber: forwards the topics it asked for.
async fn serve_subscriber(
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<BusMessage>,
    keypair: Option<Arc<StaticKeypair>>,
    handshake_timeout: Duration,
) {
    let Some(mut link) = accept_link(stream, peer, keypair, handshake_timeout, "subscriber").await else {
        return;
    };
    tracing::debug!(peer = %peer, "bus subscriber connected");

    let mut topics: HashSet<Vec<u8>> = HashSet::new();
    loop {
        tokio::select! {
            frame = link.recv_frame() => match frame {
                Ok(Some(frame)) => match parse_control(&frame) {
                    Some((true, topic)) => { topics.insert(topic.to_vec()); }
                    Some((false, topic)) => { topics.remove(topic); }
                    None => tracing::debug!(peer = %peer, "ignoring non-control frame from subscriber"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "bus subscriber link failed");
                    break;
                }
            },

            message = rx.recv() => match message {
                Ok(message) => {
                    if !topics.contains(&message.topic[..]) {
                        continue;
                    }
                    if let Err(e) = link.send_message(&message.topic, &message.payload).await {
                        tracing::warn!(peer = %peer, error = %e, "bus subscriber send failed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(peer = %peer, missed, "bus subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(peer = %peer, "bus subscriber disconnected");
}

/// A remote publisher: everything it sends goes to the local handlers.
async fn serve_publisher(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<BusMessage>,
    keypair: Option<Arc<StaticKeypair>>,
    handshake_timeout: Duration,
) {
    let Some(mut link) = accept_link(stream, peer, keypair, handshake_timeout, "publisher").await else {
        return;
    };
    tracing::debug!(peer = %peer, "bus publisher connected");

    loop {
        match link.recv_message().await {
            Ok(Some((topic, payload))) => {
                let message = BusMessage {
                    topic: Bytes::from(topic),
                    payload: Bytes::from(payload),
                };
                if let Err(e) = inbound.try_send(message) {
                    tracing::warn!(peer = %peer, error = %e, "dropping remote bus message");
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "bus publisher link failed");
                break;
            }
        }
    }
    tracing::debug!(peer = %peer, "bus publisher disconnected");
}

//! Connection engine: accepts agent WebSocket connections and drives each
//! one through the handshake into an encrypted session.
//!
//! One listener serves both the agents (WebSocket upgrade on `/`) and the
//! read-only status API (`/api/...`). Every upgraded connection runs in
//! its own task, tracked so shutdown can wait for each task's cleanup.

pub mod connection;

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use teamserver_core::config::ServerConfig;
use teamserver_core::CipherSuite;
use teamserver_services::audit::AuditSink;
use teamserver_services::auth::{parse_bearer, ConnectionAuthorizer};
use teamserver_services::{MessageHandlers, SessionRegistry, TaskResultStore};

use crate::bus::BusHandle;
use crate::running::RunningGuard;

/// Per-connection limits, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub suite: CipherSuite,
    pub handshake_timeout: Duration,
    pub max_auth_failures: u32,
    pub outbound_queue: usize,
}

impl EngineSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            suite: config.cipher_suite,
            handshake_timeout: config.handshake_timeout(),
            max_auth_failures: config.max_auth_failures.max(1),
            outbound_queue: config.outbound_queue.max(1),
        }
    }
}

/// Everything a connection task needs. Frozen before the engine serves.
pub struct EngineContext {
    pub sessions: Arc<SessionRegistry>,
    pub handlers: Arc<MessageHandlers>,
    pub task_results: TaskResultStore,
    pub bus: BusHandle,
    pub authorizer: Arc<dyn ConnectionAuthorizer>,
    pub audit: Arc<dyn AuditSink>,
    pub settings: EngineSettings,
}

#[derive(Clone)]
struct EngineState {
    ctx: Arc<EngineContext>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

pub struct ConnectionEngine {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<EngineContext>,
    api: Router,
    running: Arc<AtomicBool>,
}

impl ConnectionEngine {
    /// Bind the agent listener. `api` is merged into the same router.
    pub async fn bind(config: &ServerConfig, ctx: EngineContext, api: Router) -> Result<Self> {
        let addr = config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind connection engine on {addr}"))?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, suite = %ctx.settings.suite, "connection engine bound");

        Ok(Self {
            listener,
            local_addr,
            ctx: Arc::new(ctx),
            api,
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serve until `shutdown`, then wait for every connection task to
    /// release its session.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let state = EngineState {
            ctx: self.ctx,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        let router = Router::new()
            .route("/", get(ws_handler))
            .with_state(state)
            .merge(self.api);

        let running = RunningGuard::set(&self.running);
        let served = axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

        // Connections watch the same token; wait for their cleanup.
        tracker.close();
        tracker.wait().await;
        drop(running);
        tracing::info!("connection engine stopped");

        served.context("connection engine failed")?;
        if !shutdown.is_cancelled() {
            anyhow::bail!("connection engine exited without a shutdown request");
        }
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<EngineState>,
) -> Response {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_bearer);
    let principal = match state.ctx.authorizer.authorize(bearer) {
        Ok(principal) => principal,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "rejected connection upgrade");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let EngineState { ctx, shutdown, tracker } = state;
    // Held from before the 101 response until the connection task ends,
    // so shutdown waits for upgrades still in flight.
    let tracked = tracker.token();
    ws.on_upgrade(move |socket| async move {
        connection::run(socket, peer, principal, ctx, shutdown).await;
        drop(tracked);
    })
}

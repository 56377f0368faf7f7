//! TeamServer: wires the connection engine, the event bus and the
//! status surface together and supervises them as one unit.
//!
//! Four tasks run under one cancellation token:
//!   - `connection-engine`  agent WebSocket + status API
//!   - `event-bus`          local handlers and remote PUB/SUB links
//!   - `health-check`       healthy = engine running && bus running
//!   - `session-sweeper`    expires idle sessions
//!
//! Any task exiting on its own is a failure of the whole server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use teamserver_api::{ApiState, ServerStatus};
use teamserver_core::crypto::curve::StaticKeypair;
use teamserver_core::wire::{topics, unix_millis, ClientDisconnected, DisconnectReason};
use teamserver_core::TeamServerConfig;
use teamserver_services::audit::{self, AuditRecord, AuditSink, JsonLinesAudit, NoopAudit};
use teamserver_services::auth::{AllowAll, ConnectionAuthorizer, StaticTokens};
use teamserver_services::handlers::register_defaults;
use teamserver_services::{MessageHandler, MessageHandlers, SessionRegistry, TaskResultStore};

use crate::bus::{BusHandle, EventBus, FnTopicHandler, TopicHandler};
use crate::engine::{ConnectionEngine, EngineContext, EngineSettings};

/// Where remote bus clients connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusEndpoints {
    /// Subscribers connect here.
    pub publish: SocketAddr,
    /// Publishers connect here.
    pub subscribe: SocketAddr,
}

// ── Builder ───────────────────────────────────────────────────────────────────

pub struct TeamServerBuilder {
    config: TeamServerConfig,
    handlers: Vec<(String, Arc<dyn MessageHandler>)>,
    subscriptions: Vec<(String, Arc<dyn TopicHandler>)>,
    authorizer: Option<Arc<dyn ConnectionAuthorizer>>,
    audit: Option<Arc<dyn AuditSink>>,
    bus_keypair: Option<StaticKeypair>,
}

impl TeamServerBuilder {
    pub fn new(config: TeamServerConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            subscriptions: Vec::new(),
            authorizer: None,
            audit: None,
            bus_keypair: None,
        }
    }

    /// Handle agent messages of type `message_type`. Replaces a built-in
    /// handler of the same type.
    pub fn handler(mut self, message_type: &str, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push((message_type.to_string(), handler));
        self
    }

    /// Subscribe to a bus topic. Runs after the built-in lifecycle
    /// subscriptions, so it replaces them for the same topic.
    pub fn subscribe(mut self, topic: &str, handler: Arc<dyn TopicHandler>) -> Self {
        self.subscriptions.push((topic.to_string(), handler));
        self
    }

    pub fn authorizer(mut self, authorizer: Arc<dyn ConnectionAuthorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Use this bus key instead of the configured or a generated one.
    pub fn bus_keypair(mut self, keypair: StaticKeypair) -> Self {
        self.bus_keypair = Some(keypair);
        self
    }

    /// Bind everything, then spawn the tasks. Nothing is spawned if any
    /// bind fails.
    pub async fn start(self) -> Result<TeamServer> {
        let Self {
            config,
            handlers: extra_handlers,
            subscriptions,
            authorizer,
            audit,
            bus_keypair,
        } = self;

        let sessions = Arc::new(SessionRegistry::new());
        let task_results = TaskResultStore::new();
        let status = Arc::new(ServerStatus::new());

        let audit: Arc<dyn AuditSink> = match (audit, &config.audit.path) {
            (Some(audit), _) => audit,
            (None, Some(path)) => {
                let sink = JsonLinesAudit::open(path).context("failed to open audit log")?;
                tracing::info!(path = %path.display(), "audit log enabled");
                Arc::new(sink)
            }
            (None, None) => Arc::new(NoopAudit),
        };

        let authorizer: Arc<dyn ConnectionAuthorizer> = match authorizer {
            Some(authorizer) => authorizer,
            None if config.auth.required || !config.auth.tokens.is_empty() => Arc::new(
                StaticTokens::new(config.auth.tokens.clone(), config.auth.required),
            ),
            None => Arc::new(AllowAll),
        };

        // ── Event bus ──
        let bus_keypair = if config.bus.secure {
            match bus_keypair {
                Some(kp) => Some(kp),
                None => Some(match config.bus.keypair()? {
                    Some(kp) => kp,
                    None => {
                        let kp = StaticKeypair::generate();
                        tracing::info!("generated ephemeral event bus key");
                        kp
                    }
                }),
            }
        } else {
            None
        };
        let mut bus = EventBus::bind(&config.bus, bus_keypair)
            .await
            .context("failed to bind event bus")?;
        subscribe_lifecycle(&mut bus, &status);
        for (topic, handler) in subscriptions {
            bus.subscribe(&topic, handler);
        }
        let bus_handle = bus.handle();
        let bus_endpoints = BusEndpoints {
            publish: bus.pub_addr()?,
            subscribe: bus.sub_addr()?,
        };
        let bus_public_key = bus.public_key();

        // ── Message handlers ──
        let mut handlers = MessageHandlers::new();
        register_defaults(
            &mut handlers,
            Arc::clone(&sessions),
            task_results.clone(),
            Arc::clone(&audit),
        );
        for (message_type, handler) in extra_handlers {
            if handlers.register(message_type.as_str(), handler).is_some() {
                tracing::info!(message_type = %message_type, "replaced built-in handler");
            }
        }

        // ── Connection engine ──
        let ctx = EngineContext {
            sessions: Arc::clone(&sessions),
            handlers: Arc::new(handlers),
            task_results: task_results.clone(),
            bus: bus_handle.clone(),
            authorizer,
            audit: Arc::clone(&audit),
            settings: EngineSettings::from_config(&config.server),
        };
        let api = teamserver_api::router(ApiState {
            sessions: Arc::clone(&sessions),
            status: Arc::clone(&status),
            task_results: task_results.clone(),
        });
        let engine = ConnectionEngine::bind(&config.server, ctx, api).await?;
        let local_addr = engine.local_addr();

        // ── Tasks ──
        let shutdown = CancellationToken::new();
        let engine_running = engine.running_flag();
        let bus_running = bus.running_flag();
        let mut tasks = JoinSet::new();

        tasks.spawn(named("connection-engine", engine.serve(shutdown.clone())));
        tasks.spawn(named("event-bus", bus.run(shutdown.clone())));
        tasks.spawn(named(
            "health-check",
            health_loop(
                engine_running,
                bus_running,
                Arc::clone(&status),
                config.server.health_interval(),
                shutdown.clone(),
            ),
        ));
        tasks.spawn(named(
            "session-sweeper",
            sweep_loop(
                Arc::clone(&sessions),
                task_results.clone(),
                bus_handle.clone(),
                audit,
                config.server.session_timeout(),
                config.server.sweep_interval(),
                shutdown.clone(),
            ),
        ));

        tracing::info!(
            addr = %local_addr,
            bus_publish = %bus_endpoints.publish,
            bus_subscribe = %bus_endpoints.subscribe,
            bus_secure = bus_public_key.is_some(),
            "teamserver started"
        );

        Ok(TeamServer {
            local_addr,
            bus_endpoints,
            bus_public_key,
            sessions,
            task_results,
            status,
            bus: bus_handle,
            shutdown,
            tasks,
        })
    }
}

/// The orchestrator's own view of the lifecycle topics: logs and counters.
fn subscribe_lifecycle(bus: &mut EventBus, status: &Arc<ServerStatus>) {
    let connects = Arc::clone(status);
    bus.subscribe(
        topics::CLIENT_CONNECTED,
        Arc::new(FnTopicHandler(move |payload: Value| {
            let status = Arc::clone(&connects);
            async move {
                status.record_connect();
                tracing::info!(
                    session_id = %payload["session_id"].as_str().unwrap_or("?"),
                    address = %payload["address"].as_str().unwrap_or("?"),
                    "client connected"
                );
            }
        })),
    );

    let disconnects = Arc::clone(status);
    bus.subscribe(
        topics::CLIENT_DISCONNECTED,
        Arc::new(FnTopicHandler(move |payload: Value| {
            let status = Arc::clone(&disconnects);
            async move {
                status.record_disconnect();
                tracing::info!(
                    session_id = %payload["session_id"].as_str().unwrap_or("?"),
                    reason = %payload["reason"].as_str().unwrap_or("?"),
                    "client disconnected"
                );
            }
        })),
    );
}

type TaskOutcome = (&'static str, Result<()>);

async fn named<F>(name: &'static str, fut: F) -> TaskOutcome
where
    F: std::future::Future<Output = Result<()>>,
{
    (name, fut.await)
}

async fn health_loop(
    engine_running: Arc<AtomicBool>,
    bus_running: Arc<AtomicBool>,
    status: Arc<ServerStatus>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let healthy = engine_running.load(Ordering::Relaxed) && bus_running.load(Ordering::Relaxed);
                if healthy != status.is_healthy() {
                    tracing::info!(healthy, "health changed");
                }
                status.set_healthy(healthy);
            }
        }
    }
    status.set_healthy(false);
    Ok(())
}

async fn sweep_loop(
    sessions: Arc<SessionRegistry>,
    task_results: TaskResultStore,
    bus: BusHandle,
    audit: Arc<dyn AuditSink>,
    timeout: std::time::Duration,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    // The first tick is immediate and would find nothing to do.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let expired = sessions.sweep_expired(timeout);
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "expired idle sessions");
                }
                for info in expired {
                    task_results.remove_session(&info.id);
                    bus.publish(
                        topics::CLIENT_DISCONNECTED,
                        &ClientDisconnected {
                            session_id: info.id.clone(),
                            address: info.address.clone(),
                            reason: DisconnectReason::Expired,
                            timestamp: unix_millis(),
                        },
                    );
                    audit::record(audit.as_ref(), AuditRecord::closed(&info.id, DisconnectReason::Expired));
                }
            }
        }
    }
}

// ── Running server ────────────────────────────────────────────────────────────

pub struct TeamServer {
    local_addr: SocketAddr,
    bus_endpoints: BusEndpoints,
    bus_public_key: Option<[u8; 32]>,
    sessions: Arc<SessionRegistry>,
    task_results: TaskResultStore,
    status: Arc<ServerStatus>,
    bus: BusHandle,
    shutdown: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
}

impl TeamServer {
    pub fn builder(config: TeamServerConfig) -> TeamServerBuilder {
        TeamServerBuilder::new(config)
    }

    /// Start with the built-in handlers and subscriptions only.
    pub async fn start(config: TeamServerConfig) -> Result<Self> {
        TeamServerBuilder::new(config).start().await
    }

    /// Agent WebSocket and status API address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bus_endpoints(&self) -> BusEndpoints {
        self.bus_endpoints
    }

    /// The bus's static public key, `None` when the bus is insecure.
    pub fn bus_public_key(&self) -> Option<[u8; 32]> {
        self.bus_public_key
    }

    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.sessions)
    }

    /// Results reported by agents of live sessions.
    pub fn task_results(&self) -> TaskResultStore {
        self.task_results.clone()
    }

    pub fn bus(&self) -> BusHandle {
        self.bus.clone()
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Resolves only when a task stops on its own, which is always an
    /// error. Everything else is cancelled before returning.
    pub async fn wait(&mut self) -> Result<()> {
        let failure = match self.tasks.join_next().await {
            None => anyhow::anyhow!("teamserver has no running tasks"),
            Some(Ok((name, Ok(())))) => anyhow::anyhow!("{name} exited unexpectedly"),
            Some(Ok((name, Err(e)))) => e.context(format!("{name} failed")),
            Some(Err(e)) => anyhow::anyhow!("teamserver task panicked: {e}"),
        };
        tracing::error!(error = %format!("{failure:#}"), "teamserver task failed, shutting down");
        self.shutdown.cancel();
        while self.tasks.join_next().await.is_some() {}
        Err(failure)
    }

    /// Cancel every task and wait for all of them. Returns the first
    /// task error, if any.
    pub async fn stop(mut self) -> Result<()> {
        tracing::info!("teamserver stopping");
        self.shutdown.cancel();
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(e))) => e.context(format!("{name} failed")),
                Err(e) => anyhow::anyhow!("teamserver task panicked: {e}"),
            };
            tracing::warn!(error = %format!("{failure:#}"), "task failed during shutdown");
            first_error.get_or_insert(failure);
        }
        tracing::info!("teamserver stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for TeamServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

//! Agent message handlers.
//!
//! A handler receives one decrypted message plus the id of the session it
//! arrived on, and may return a JSON reply which the connection engine
//! encrypts and sends back on the same session.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use teamserver_core::message::{reply, AgentError, Checkin, Inbound, MessageKind, TaskResult};
use teamserver_core::wire::unix_millis;

use crate::audit::{self, AuditRecord, AuditSink};
use crate::dispatch::HandlerRegistry;
use crate::session::SessionRegistry;
use crate::task_store::TaskResultStore;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Inbound, session_id: &str) -> Option<Value>;
}

/// Message-type tag → handler.
pub type MessageHandlers = HandlerRegistry<String, dyn MessageHandler>;

/// Adapts an async closure into a `MessageHandler`.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Inbound, String) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Value>> + Send,
{
    async fn handle(&self, message: &Inbound, session_id: &str) -> Option<Value> {
        (self.0)(message.clone(), session_id.to_string()).await
    }
}

// ── checkin ───────────────────────────────────────────────────────────────────

pub struct CheckinHandler {
    sessions: Arc<SessionRegistry>,
    audit: Arc<dyn AuditSink>,
}

impl CheckinHandler {
    pub fn new(sessions: Arc<SessionRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self { sessions, audit }
    }
}

#[async_trait]
impl MessageHandler for CheckinHandler {
    async fn handle(&self, message: &Inbound, session_id: &str) -> Option<Value> {
        let Ok(checkin) = message.decode::<Checkin>() else {
            tracing::warn!(session_id, "checkin with malformed fields");
            return Some(reply::error(reply::INVALID_FORMAT));
        };
        let Some(agent) = checkin.validate() else {
            return Some(reply::error(reply::MISSING_CHECKIN_INFO));
        };

        let record = AuditRecord::SessionCheckin {
            session_id: session_id.to_string(),
            hostname: agent.hostname.clone(),
            username: agent.username.clone(),
            os: agent.os.clone(),
            timestamp: unix_millis(),
        };
        tracing::info!(
            session_id,
            hostname = %agent.hostname,
            username = %agent.username,
            os = %agent.os,
            "checkin"
        );

        if !self.sessions.record_checkin(session_id, agent) {
            tracing::error!(session_id, "session not found during checkin");
            return Some(reply::error(reply::SESSION_NOT_FOUND));
        }
        audit::record(self.audit.as_ref(), record);

        Some(reply::checkin_response(session_id))
    }
}

// ── task_result ───────────────────────────────────────────────────────────────

pub struct TaskResultHandler {
    store: TaskResultStore,
}

impl TaskResultHandler {
    pub fn new(store: TaskResultStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for TaskResultHandler {
    async fn handle(&self, message: &Inbound, session_id: &str) -> Option<Value> {
        let Ok(result) = message.decode::<TaskResult>() else {
            return Some(reply::error(reply::INVALID_FORMAT));
        };
        let task_id = match result.task_id {
            Some(id) if !id.is_empty() && !result.result.is_null() => id,
            _ => {
                tracing::warn!(session_id, "task_result missing task_id or result");
                return Some(reply::error(reply::MISSING_TASK_RESULT));
            }
        };

        tracing::info!(session_id, task_id = %task_id, "task result received");
        self.store.insert(&task_id, session_id, result.result);
        Some(reply::task_result_response(&task_id))
    }
}

// ── error ─────────────────────────────────────────────────────────────────────

pub struct AgentErrorHandler;

#[async_trait]
impl MessageHandler for AgentErrorHandler {
    async fn handle(&self, message: &Inbound, session_id: &str) -> Option<Value> {
        let report = message.decode::<AgentError>().unwrap_or_default();
        match (report.error_type, report.message) {
            (Some(kind), Some(text)) if !kind.is_empty() && !text.is_empty() => {
                tracing::error!(session_id, error_type = %kind, message = %text, "agent reported error");
                Some(reply::error_response())
            }
            _ => {
                tracing::warn!(session_id, "error report missing error_type or message");
                Some(reply::error(reply::INVALID_ERROR_DATA))
            }
        }
    }
}

/// Register the built-in handlers for `checkin`, `task_result` and `error`.
pub fn register_defaults(
    handlers: &mut MessageHandlers,
    sessions: Arc<SessionRegistry>,
    store: TaskResultStore,
    audit: Arc<dyn AuditSink>,
) {
    handlers.register(
        MessageKind::Checkin.tag(),
        Arc::new(CheckinHandler::new(sessions, audit)),
    );
    handlers.register(
        MessageKind::TaskResult.tag(),
        Arc::new(TaskResultHandler::new(store)),
    );
    handlers.register(MessageKind::Error.tag(), Arc::new(AgentErrorHandler));
    tracing::debug!(count = handlers.len(), "default message handlers registered");
}

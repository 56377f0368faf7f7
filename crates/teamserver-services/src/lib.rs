//! teamserver-services: session bookkeeping and message handling that
//! sits between the transport and the application.

pub mod audit;
pub mod auth;
pub mod dispatch;
pub mod handlers;
pub mod session;
pub mod task_store;

pub use dispatch::HandlerRegistry;
pub use handlers::{MessageHandler, MessageHandlers};
pub use session::{SessionId, SessionInfo, SessionLink, SessionRegistry};
pub use task_store::{StoredResult, TaskResultStore};

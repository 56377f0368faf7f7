//! teamserver-bus: the event bus wire link and its remote clients.
//!
//! Shared by the daemon, which serves the PUB/SUB endpoints, and by
//! anything that only needs to talk to them, such as `teamserver-ctl`.

pub mod client;
pub mod link;

use teamserver_core::CryptoError;
use thiserror::Error;

pub use client::{BusPublisher, BusSecurity, BusSubscriber};
pub use link::BusLink;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bus link crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("bus link closed")]
    Closed,
    #[error("bus protocol error: {0}")]
    Protocol(&'static str),
}

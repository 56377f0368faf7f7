//! teamserver-core: session crypto, wire types, agent messages and
//! configuration. All other teamserver crates depend on this one.

pub mod config;
pub mod crypto;
pub mod message;
pub mod wire;

pub use config::TeamServerConfig;
pub use crypto::{CipherSuite, CryptoError, CryptoSession, Role};
pub use message::{Inbound, MessageKind};

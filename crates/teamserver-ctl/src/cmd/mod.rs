//! CLI command modules.

pub mod events;
pub mod http;
pub mod sessions;
pub mod status;

//! teamserverd: the connection engine, the event bus and the TeamServer
//! orchestrator that supervises them.

pub mod bus;
pub mod engine;
pub mod server;

mod running;

pub use bus::{BusHandle, BusPublisher, BusSecurity, BusSubscriber, EventBus, FnTopicHandler, TopicHandler};
pub use server::{BusEndpoints, TeamServer, TeamServerBuilder};

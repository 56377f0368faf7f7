//! Remote bus clients.
//!
//! `BusSubscriber` connects to the PUB endpoint and receives the topics it
//! subscribed to; `BusPublisher` connects to the SUB endpoint and feeds
//! messages to the server's local handlers.

use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::link::{control_frame, BusLink};
use crate::BusError;

#[derive(Debug, Clone, Copy)]
pub enum BusSecurity {
    /// Plain TCP. Only for trusted networks.
    Insecure,
    /// Noise_XX, accepting only a server holding this static key.
    Curve { server_public: [u8; 32] },
}

impl BusSecurity {
    fn pinned(self) -> Option<[u8; 32]> {
        match self {
            BusSecurity::Insecure => None,
            BusSecurity::Curve { server_public } => Some(server_public),
        }
    }
}

pub struct BusSubscriber {
    link: BusLink,
}

impl BusSubscriber {
    pub async fn connect(addr: impl ToSocketAddrs, security: BusSecurity) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let link = BusLink::connect(stream, security.pinned()).await?;
        Ok(Self { link })
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<(), BusError> {
        self.link.send_frame(&control_frame(true, topic.as_bytes())).await
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), BusError> {
        self.link.send_frame(&control_frame(false, topic.as_bytes())).await
    }

    /// Next `(topic, payload)`, or `None` once the server went away.
    pub async fn recv(&mut self) -> Result<Option<(String, Value)>, BusError> {
        let Some((topic, payload)) = self.link.recv_message().await? else {
            return Ok(None);
        };
        let topic = String::from_utf8(topic).map_err(|_| BusError::Protocol("topic is not UTF-8"))?;
        Ok(Some((topic, serde_json::from_slice(&payload)?)))
    }
}

pub struct BusPublisher {
    link: BusLink,
}

impl BusPublisher {
    pub async fn connect(addr: impl ToSocketAddrs, security: BusSecurity) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let link = BusLink::connect(stream, security.pinned()).await?;
        Ok(Self { link })
    }

    pub async fn publish<T: Serialize + ?Sized>(&mut self, topic: &str, payload: &T) -> Result<(), BusError> {
        let json = serde_json::to_vec(payload)?;
        self.link.send_message(topic.as_bytes(), &json).await
    }
}

//! One TCP link of the event bus.
//!
//! Frames are length-delimited. In secure mode a Noise_XX handshake runs
//! first and every later frame is sealed with the resulting channel.
//! A bus message is two frames, topic then JSON payload; subscription
//! control frames are a single `0x01‖topic` / `0x00‖topic`.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use teamserver_core::crypto::curve::{
    CurveChannel, CurveInitiator, CurveResponder, StaticKeypair,
};

use crate::BusError;

/// Upper bound on one frame on the wire.
pub const MAX_FRAME: usize = 1 << 20;

pub const SUBSCRIBE: u8 = 0x01;
pub const UNSUBSCRIBE: u8 = 0x00;

pub struct BusLink {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    channel: Option<CurveChannel>,
}

impl BusLink {
    fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
        let _ = stream.set_nodelay(true);
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME)
            .new_codec();
        Framed::new(stream, codec)
    }

    /// Server side. With a keypair, runs the responder handshake before
    /// returning.
    pub async fn accept(stream: TcpStream, keypair: Option<&StaticKeypair>) -> Result<Self, BusError> {
        let mut framed = Self::framed(stream);
        let channel = match keypair {
            None => None,
            Some(keypair) => {
                let responder = CurveResponder::new(keypair)?;
                let msg1 = read_raw(&mut framed).await?;
                let (pending, msg2) = responder.respond(&msg1)?;
                framed.send(Bytes::from(msg2)).await?;
                let msg3 = read_raw(&mut framed).await?;
                Some(pending.finish(&msg3)?)
            }
        };
        Ok(Self { framed, channel })
    }

    /// Client side. With a pinned server key, runs the initiator
    /// handshake and refuses any other server.
    pub async fn connect(stream: TcpStream, server_public: Option<[u8; 32]>) -> Result<Self, BusError> {
        let mut framed = Self::framed(stream);
        let channel = match server_public {
            None => None,
            Some(server_public) => {
                let local = StaticKeypair::generate();
                let (initiator, msg1) = CurveInitiator::new(&local, server_public)?;
                framed.send(Bytes::from(msg1)).await?;
                let msg2 = read_raw(&mut framed).await?;
                let (channel, msg3) = initiator.finish(&msg2)?;
                framed.send(Bytes::from(msg3)).await?;
                Some(channel)
            }
        };
        Ok(Self { framed, channel })
    }

    pub fn is_secure(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), BusError> {
        let bytes = match self.channel.as_mut() {
            Some(channel) => Bytes::from(channel.seal(frame)?),
            None => Bytes::copy_from_slice(frame),
        };
        self.framed.send(bytes).await?;
        Ok(())
    }

    /// Next frame, or `None` once the peer closed the link. Cancel safe.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, BusError> {
        match self.framed.next().await {
            None => Ok(None),
            Some(Err(e)) => Err(e.into()),
            Some(Ok(raw)) => match self.channel.as_mut() {
                Some(channel) => Ok(Some(channel.open(&raw)?)),
                None => Ok(Some(raw.to_vec())),
            },
        }
    }

    pub async fn send_message(&mut self, topic: &[u8], payload: &[u8]) -> Result<(), BusError> {
        self.send_frame(topic).await?;
        self.send_frame(payload).await
    }

    /// Next `(topic, payload)` pair. Not cancel safe: dropping it between
    /// the two frames desynchronizes the link.
    pub async fn recv_message(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BusError> {
        let Some(topic) = self.recv_frame().await? else {
            return Ok(None);
        };
        match self.recv_frame().await? {
            Some(payload) => Ok(Some((topic, payload))),
            None => Err(BusError::Protocol("link closed between topic and payload")),
        }
    }
}

async fn read_raw(framed: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Result<Vec<u8>, BusError> {
    match framed.next().await {
        Some(Ok(raw)) => Ok(raw.to_vec()),
        Some(Err(e)) => Err(e.into()),
        None => Err(BusError::Closed),
    }
}

/// Build a subscription control frame.
pub fn control_frame(subscribe: bool, topic: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(topic.len() + 1);
    frame.push(if subscribe { SUBSCRIBE } else { UNSUBSCRIBE });
    frame.extend_from_slice(topic);
    frame
}

/// Split a control frame into `(subscribe, topic)`.
pub fn parse_control(frame: &[u8]) -> Option<(bool, &[u8])> {
    match frame.split_first() {
        Some((&SUBSCRIBE, topic)) => Some((true, topic)),
        Some((&UNSUBSCRIBE, topic)) => Some((false, topic)),
        _ => None,
    }
}

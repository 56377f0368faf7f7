//! Link security for the event bus.
//!
//! Remote bus peers run a Noise_XX handshake over the framed TCP link before
//! any topic traffic flows. The bus holds a long-term X25519 static keypair;
//! clients pin its public key and refuse to talk to anything else. Client
//! static keys are not pinned.
//!
//! Handshake, three messages:
//!   -> e
//!   <- e, ee, s, es        client checks s against the pinned server key
//!   -> s, se
//!
//! The types here are sans-io: they turn handshake bytes into more
//! handshake bytes and finally a `CurveChannel`. Moving the bytes is the
//! bus link's job.

use rand::RngCore;
use snow::{Builder, HandshakeState, TransportState};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Largest Noise message, and the ChaChaPoly tag every sealed frame carries.
const NOISE_MAX_MESSAGE: usize = 65535;
const NOISE_TAG_LEN: usize = 16;

/// Largest plaintext a single sealed frame can carry.
pub const MAX_SEALED_PAYLOAD: usize = NOISE_MAX_MESSAGE - NOISE_TAG_LEN;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A long-term static X25519 keypair.
///
/// The bus loads one from configuration (hex private key) or generates a
/// fresh one at startup. The private key never leaves this struct except
/// through `private_bytes`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticKeypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl StaticKeypair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let kp = Self::from_private(bytes);
        bytes.zeroize();
        kp
    }

    /// Rebuild a keypair from stored private key bytes. The public key is
    /// always derived, never stored.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Parse a 64-character hex private key, as found in the config file.
    pub fn from_hex(private_hex: &str) -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(private_hex.trim(), bytes.as_mut_slice())
            .map_err(|_| CryptoError::KeyEncoding)?;
        Ok(Self::from_private(*bytes))
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.public)
    }
}

impl std::fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeypair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a 64-character hex public key.
pub fn public_key_from_hex(public_hex: &str) -> Result<[u8; 32], CryptoError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(public_hex.trim(), &mut bytes).map_err(|_| CryptoError::KeyEncoding)?;
    Ok(bytes)
}

fn builder(keypair: &StaticKeypair) -> Result<Builder<'_>, CryptoError> {
    let params = NOISE_PATTERN.parse().map_err(CryptoError::Noise)?;
    Ok(Builder::new(params).local_private_key(keypair.private.as_slice()))
}

// ── Initiator (bus client) ────────────────────────────────────────────────────

pub struct CurveInitiator {
    state: HandshakeState,
    server_public: [u8; 32],
}

impl CurveInitiator {
    /// Start a handshake towards a bus whose static key is `server_public`.
    ///
    /// Returns the initiator and message 1.
    pub fn new(
        keypair: &StaticKeypair,
        server_public: [u8; 32],
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = builder(keypair)?.build_initiator()?;

        let mut msg1 = vec![0u8; NOISE_MAX_MESSAGE];
        let len = state.write_message(&[], &mut msg1)?;
        msg1.truncate(len);

        Ok((
            Self {
                state,
                server_public,
            },
            msg1,
        ))
    }

    /// Read message 2, check the server's static key, and write message 3.
    pub fn finish(mut self, msg2: &[u8]) -> Result<(CurveChannel, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
        self.state.read_message(msg2, &mut payload)?;

        match self.state.get_remote_static() {
            Some(remote) if remote == self.server_public.as_slice() => {}
            _ => return Err(CryptoError::UntrustedServerKey),
        }

        let mut msg3 = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self.state.write_message(&[], &mut msg3)?;
        msg3.truncate(len);

        let transport = self.state.into_transport_mode()?;
        Ok((CurveChannel::new(transport, self.server_public), msg3))
    }
}

// ── Responder (bus) ───────────────────────────────────────────────────────────

pub struct CurveResponder {
    state: HandshakeState,
}

impl CurveResponder {
    pub fn new(keypair: &StaticKeypair) -> Result<Self, CryptoError> {
        Ok(Self {
            state: builder(keypair)?.build_responder()?,
        })
    }

    /// Read message 1 and write message 2.
    pub fn respond(mut self, msg1: &[u8]) -> Result<(CurveResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
        self.state.read_message(msg1, &mut payload)?;

        let mut msg2 = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self.state.write_message(&[], &mut msg2)?;
        msg2.truncate(len);

        Ok((CurveResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3.
pub struct CurveResponderPending {
    state: HandshakeState,
}

impl CurveResponderPending {
    pub fn finish(mut self, msg3: &[u8]) -> Result<CurveChannel, CryptoError> {
        let mut payload = vec![0u8; NOISE_MAX_MESSAGE];
        self.state.read_message(msg3, &mut payload)?;

        let mut remote = [0u8; 32];
        match self.state.get_remote_static() {
            Some(key) if key.len() == 32 => remote.copy_from_slice(key),
            _ => return Err(CryptoError::InvalidPeerKey),
        }

        let transport = self.state.into_transport_mode()?;
        Ok(CurveChannel::new(transport, remote))
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// An established bus link cipher.
///
/// Uses Noise's stateful transport with implicit nonces, so frames must be
/// opened in the order they were sealed. The bus runs over TCP, which
/// guarantees that; a dropped or reordered frame fails authentication.
pub struct CurveChannel {
    transport: TransportState,
    remote_static: [u8; 32],
}

impl CurveChannel {
    fn new(transport: TransportState, remote_static: [u8; 32]) -> Self {
        Self {
            transport,
            remote_static,
        }
    }

    /// The peer's static public key as learned during the handshake.
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_SEALED_PAYLOAD {
            return Err(CryptoError::FrameTooLarge(plaintext.len()));
        }
        let mut out = vec![0u8; plaintext.len() + NOISE_TAG_LEN];
        let len = self.transport.write_message(plaintext, &mut out)?;
        out.truncate(len);
        Ok(out)
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NOISE_TAG_LEN {
            return Err(CryptoError::MalformedFrame);
        }
        let mut out = vec![0u8; sealed.len()];
        let len = self
            .transport
            .read_message(sealed, &mut out)
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        out.truncate(len);
        Ok(out)
    }
}

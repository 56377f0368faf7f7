//! Cryptographic primitives for the teamserver.
//!
//! Provides two things:
//!   1. `CryptoSession`: per-connection P-384 ECDH + HKDF-SHA256 key
//!      agreement and the framed encryption used on agent connections
//!   2. `curve`: Noise_XX link security for the event bus, keyed by a
//!      long-term X25519 static keypair
//!
//! All key material derives ZeroizeOnDrop or sits in `Zeroizing` buffers.
//! There is no unsafe code in this module.

pub mod curve;
mod replay;
mod session;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use replay::ReplayWindow;
pub use session::CryptoSession;

/// Protocol version string. Every HKDF info string is prefixed with it, so
/// bumping it invalidates every derived key.
pub const PROTOCOL_VERSION: &str = "c2-session-v1";

// ── Cipher suite ──────────────────────────────────────────────────────────────

/// The single symmetric suite a deployment speaks on agent connections.
///
/// Both ends must agree; it is selected by configuration and never
/// negotiated on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    /// AES-256-GCM with counter nonces. 32 bytes of key material.
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    /// AES-256-CBC (PKCS#7) then HMAC-SHA256 over IV || ciphertext.
    /// 64 bytes of key material: encryption key then MAC key.
    #[serde(rename = "aes-256-cbc-hmac-sha256")]
    Aes256CbcHmacSha256,
}

impl CipherSuite {
    /// Bytes of HKDF output this suite consumes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes256Gcm => 32,
            Self::Aes256CbcHmacSha256 => 64,
        }
    }

    /// Versioned HKDF info string. Distinct per suite so a shared secret
    /// never yields the same key under two suites.
    pub fn kdf_info(self) -> &'static [u8] {
        match self {
            Self::Aes256Gcm => b"c2-session-v1/aes-256-gcm",
            Self::Aes256CbcHmacSha256 => b"c2-session-v1/aes-256-cbc-hmac-sha256",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Aes256CbcHmacSha256 => "aes-256-cbc-hmac-sha256",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes-256-gcm" => Some(Self::Aes256Gcm),
            "aes-256-cbc-hmac-sha256" => Some(Self::Aes256CbcHmacSha256),
            _ => None,
        }
    }
}

impl std::fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ── Role ──────────────────────────────────────────────────────────────────────

/// Which end of a connection a `CryptoSession` belongs to.
///
/// Both directions share one key, so the role picks the 4-byte nonce prefix
/// that keeps the two counter streams disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    pub fn nonce_prefix(self) -> [u8; 4] {
        match self {
            Self::Server => [0, 0, 0, 1],
            Self::Client => [0, 0, 0, 2],
        }
    }

    pub fn peer(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("session key not established")]
    NotReady,

    #[error("session key already established")]
    AlreadyEstablished,

    #[error("peer public key is not a valid P-384 point")]
    InvalidPeerKey,

    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("replayed or too-old nonce")]
    Replay,

    #[error("malformed ciphertext frame")]
    MalformedFrame,

    #[error("send nonce counter exhausted")]
    NonceExhausted,

    #[error("failed to encode public key")]
    KeyEncoding,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("frame of {0} bytes exceeds the sealed payload limit")]
    FrameTooLarge(usize),

    #[error("server static key does not match the configured key")]
    UntrustedServerKey,
}

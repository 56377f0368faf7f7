//! Per-connection session crypto.
//!
//! Each connection generates a fresh P-384 key pair, exchanges PEM public
//! keys in the clear, and derives its symmetric key material with
//! HKDF-SHA256 over the ECDH shared secret. After that every frame is
//! base64 text:
//!
//!   aes-256-gcm              nonce(12) || ciphertext || tag(16)
//!   aes-256-cbc-hmac-sha256  iv(16) || ciphertext || hmac-sha256(32)
//!
//! GCM nonces are `role prefix(4) || send counter(8, BE)`, never random, so
//! a nonce cannot repeat under one key for the life of the session. CBC IVs
//! must be unpredictable and are drawn from the OS RNG.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use p384::ecdh::EphemeralSecret;
use p384::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use p384::PublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use super::{CipherSuite, CryptoError, ReplayWindow, Role};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

const GCM_NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;
const CBC_BLOCK_LEN: usize = 16;
const HMAC_TAG_LEN: usize = 32;

/// Cryptographic state for exactly one connection.
///
/// The ephemeral secret is consumed by `complete_exchange` and the derived
/// key material is set exactly once. Not Sync: the send counter and replay
/// window need exclusive access, so share it as `Arc<Mutex<CryptoSession>>`.
pub struct CryptoSession {
    role: Role,
    suite: CipherSuite,
    /// Zeroized on drop by p384. `None` once the exchange has completed.
    secret: Option<EphemeralSecret>,
    public_pem: String,
    key_material: Option<Zeroizing<Vec<u8>>>,
    send_counter: u64,
    recv_window: ReplayWindow,
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("role", &self.role)
            .field("suite", &self.suite)
            .field("established", &self.is_established())
            .field("send_counter", &self.send_counter)
            .finish_non_exhaustive()
    }
}

impl CryptoSession {
    /// Generate a fresh ephemeral P-384 key pair for one connection.
    pub fn generate(role: Role, suite: CipherSuite) -> Result<Self, CryptoError> {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_pem = secret
            .public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| CryptoError::KeyEncoding)?;

        Ok(Self {
            role,
            suite,
            secret: Some(secret),
            public_pem,
            key_material: None,
            send_counter: 0,
            recv_window: ReplayWindow::new(),
        })
    }

    /// Our public key as SubjectPublicKeyInfo PEM, sent in the clear.
    pub fn public_key(&self) -> &str {
        &self.public_pem
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn is_established(&self) -> bool {
        self.key_material.is_some()
    }

    /// Decode the peer's PEM public key, run ECDH and derive the session
    /// key material. Runs to completion without yielding, so a half-derived
    /// key is never observable.
    pub fn complete_exchange(&mut self, peer_public_pem: &str) -> Result<(), CryptoError> {
        if self.key_material.is_some() {
            return Err(CryptoError::AlreadyEstablished);
        }
        let peer = PublicKey::from_public_key_pem(peer_public_pem)
            .map_err(|_| CryptoError::InvalidPeerKey)?;

        let secret = self.secret.as_ref().ok_or(CryptoError::NotReady)?;
        if peer == secret.public_key() {
            // Our own key reflected back at us.
            return Err(CryptoError::InvalidPeerKey);
        }

        let shared = secret.diffie_hellman(&peer);
        let material = derive_key_material(shared.raw_secret_bytes(), self.suite)?;

        self.secret = None;
        self.key_material = Some(material);
        Ok(())
    }

    /// Encrypt `plaintext` into a base64 frame.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<String, CryptoError> {
        if self.key_material.is_none() {
            return Err(CryptoError::NotReady);
        }

        let frame = match self.suite {
            CipherSuite::Aes256Gcm => {
                let nonce = self.next_nonce()?;
                seal_gcm(self.keys()?, &nonce, plaintext)?
            }
            CipherSuite::Aes256CbcHmacSha256 => seal_cbc_hmac(self.keys()?, plaintext)?,
        };
        Ok(BASE64.encode(frame))
    }

    /// Decrypt a base64 frame produced by the peer's `encrypt`.
    ///
    /// Authentication failure is final for this frame; the session itself
    /// stays usable.
    pub fn decrypt(&mut self, frame: &str) -> Result<Vec<u8>, CryptoError> {
        if self.key_material.is_none() {
            return Err(CryptoError::NotReady);
        }
        let raw = BASE64
            .decode(frame.trim())
            .map_err(|_| CryptoError::MalformedFrame)?;

        match self.suite {
            CipherSuite::Aes256Gcm => self.open_gcm(&raw),
            CipherSuite::Aes256CbcHmacSha256 => open_cbc_hmac(self.keys()?, &raw),
        }
    }

    /// Drop the derived key material. Every later encrypt/decrypt fails
    /// with `NotReady`.
    pub fn invalidate(&mut self) {
        self.key_material = None;
        self.secret = None;
    }

    fn keys(&self) -> Result<&[u8], CryptoError> {
        self.key_material
            .as_ref()
            .map(|k| k.as_slice())
            .ok_or(CryptoError::NotReady)
    }

    fn next_nonce(&mut self) -> Result<[u8; GCM_NONCE_LEN], CryptoError> {
        let counter = self.send_counter;
        self.send_counter = counter.checked_add(1).ok_or(CryptoError::NonceExhausted)?;

        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce[..4].copy_from_slice(&self.role.nonce_prefix());
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(nonce)
    }

    fn open_gcm(&mut self, raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if raw.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
            return Err(CryptoError::MalformedFrame);
        }
        let (nonce, sealed) = raw.split_at(GCM_NONCE_LEN);

        // Frames carrying our own prefix are reflections of our own output.
        if nonce[..4] != self.role.peer().nonce_prefix() {
            return Err(CryptoError::AuthenticationFailed);
        }
        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&nonce[4..]);
        let counter = u64::from_be_bytes(counter_bytes);

        if !self.recv_window.check(counter) {
            return Err(CryptoError::Replay);
        }

        let key = self
            .key_material
            .as_ref()
            .ok_or(CryptoError::NotReady)?;
        let cipher =
            Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CryptoError::KeyDerivation)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.recv_window.mark(counter);
        Ok(plaintext)
    }

    #[cfg(test)]
    fn key_material(&self) -> Option<&[u8]> {
        self.key_material.as_ref().map(|k| k.as_slice())
    }
}

// ── Key derivation ────────────────────────────────────────────────────────────

fn derive_key_material(
    shared_secret: &[u8],
    suite: CipherSuite,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = Zeroizing::new(vec![0u8; suite.key_len()]);
    hk.expand(suite.kdf_info(), okm.as_mut_slice())
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

// ── AES-256-GCM ───────────────────────────────────────────────────────────────

fn seal_gcm(
    key: &[u8],
    nonce: &[u8; GCM_NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyDerivation)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::FrameTooLarge(plaintext.len()))?;

    let mut frame = Vec::with_capacity(GCM_NONCE_LEN + sealed.len());
    frame.extend_from_slice(nonce);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

// ── AES-256-CBC + HMAC-SHA256 ─────────────────────────────────────────────────

fn seal_cbc_hmac(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let (enc_key, mac_key) = key.split_at(32);

    let mut iv = [0u8; CBC_IV_LEN];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(enc_key, &iv)
        .map_err(|_| CryptoError::KeyDerivation)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut frame = Vec::with_capacity(CBC_IV_LEN + ciphertext.len() + HMAC_TAG_LEN);
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(&frame);
    frame.extend_from_slice(&mac.finalize().into_bytes());
    Ok(frame)
}

/// MAC is verified in constant time before any block is decrypted or
/// unpadded, so padding errors are unreachable for forged frames.
fn open_cbc_hmac(key: &[u8], raw: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if raw.len() < CBC_IV_LEN + CBC_BLOCK_LEN + HMAC_TAG_LEN {
        return Err(CryptoError::MalformedFrame);
    }
    let (enc_key, mac_key) = key.split_at(32);
    let (authenticated, tag) = raw.split_at(raw.len() - HMAC_TAG_LEN);

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(mac_key).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(authenticated);
    mac.verify_slice(tag)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let (iv, ciphertext) = authenticated.split_at(CBC_IV_LEN);
    if ciphertext.len() % CBC_BLOCK_LEN != 0 {
        return Err(CryptoError::MalformedFrame);
    }
    Aes256CbcDec::new_from_slices(enc_key, iv)
        .map_err(|_| CryptoError::KeyDerivation)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

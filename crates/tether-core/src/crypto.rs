//! Cryptographic primitives for Tether.
//!
//! Provides three things:
//!   1. Noise_IX handshake wrappers. Two messages, both static keys carried
//!      in the handshake, payloads carry certificates and session indexes.
//!   2. CryptoSession: per-peer ChaCha20-Poly1305 with an explicit 64-bit
//!      counter nonce and a sliding replay window.
//!   3. BLAKE3 helpers for digests and per-direction key derivation from the
//!      Noise handshake hash.
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise state machine using those keys.
//!
//! All key material derives ZeroizeOnDrop.
//! There is no unsafe code in this module.

use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use parking_lot::Mutex;
use snow::{Builder, HandshakeState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::wire::{Header, MessageType, HEADER_LEN};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

const KDF_INITIATOR_TO_RESPONDER: &str = "tether 2026-10 session key initiator->responder";
const KDF_RESPONDER_TO_INITIATOR: &str = "tether 2026-10 session key responder->initiator";

// ── Keypair ───────────────────────────────────────────────────────────────────

/// The Noise protocol pattern Tether uses.
///
/// Noise_IX: both static keys are sent during the handshake, which completes
/// in two messages. The initiator's static key travels in cleartext; the
/// certificate binding it to a virtual address is public anyway.
const NOISE_PATTERN: &str = "Noise_IX_25519_ChaChaPoly_BLAKE2s";

/// Upper bound for a single Noise handshake message.
const NOISE_MAX_MESSAGE: usize = 65535;

/// A node's long-term static X25519 keypair.
///
/// The public key is embedded in the node's certificate. The private key
/// never leaves this struct.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key. Zeroized on drop.
    private: Zeroizing<[u8; 32]>,
    /// Public key, carried in the certificate.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

fn noise_builder(keypair: &Keypair) -> Result<Builder<'_>, CryptoError> {
    let params = NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?;
    Ok(Builder::new(params).local_private_key(&keypair.private[..]))
}

fn remote_static(state: &HandshakeState) -> Result<[u8; 32], CryptoError> {
    state
        .get_remote_static()
        .and_then(|s| <[u8; 32]>::try_from(s).ok())
        .ok_or(CryptoError::MissingRemoteStatic)
}

fn into_session(state: &HandshakeState, is_initiator: bool) -> Result<CryptoSession, CryptoError> {
    if !state.is_handshake_finished() {
        return Err(CryptoError::HandshakeIncomplete);
    }
    let handshake_hash: [u8; 32] = state
        .get_handshake_hash()
        .try_into()
        .map_err(|_| CryptoError::HandshakeIncomplete)?;

    let i2r = Zeroizing::new(blake3::derive_key(KDF_INITIATOR_TO_RESPONDER, &handshake_hash));
    let r2i = Zeroizing::new(blake3::derive_key(KDF_RESPONDER_TO_INITIATOR, &handshake_hash));
    let (send_key, recv_key) = if is_initiator { (&i2r, &r2i) } else { (&r2i, &i2r) };

    Ok(CryptoSession::new(handshake_hash, send_key, recv_key))
}

/// Initiator side of the Noise_IX handshake.
///
/// Writes message 1 on construction and completes on message 2.
pub struct HandshakeInitiator {
    state: HandshakeState,
}

impl HandshakeInitiator {
    /// Begin a handshake as the initiator.
    ///
    /// Returns the initiator state and the Noise bytes of message 1, which
    /// carry `payload` (the certificate and our index) in cleartext.
    pub fn new(keypair: &Keypair, payload: &[u8]) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = noise_builder(keypair)?
            .build_initiator()
            .map_err(CryptoError::Noise)?;

        let mut msg1 = vec![0u8; NOISE_MAX_MESSAGE];
        let len = state
            .write_message(payload, &mut msg1)
            .map_err(CryptoError::Noise)?;
        msg1.truncate(len);

        Ok((Self { state }, msg1))
    }

    /// Process the responder's message 2 and complete the handshake.
    ///
    /// On failure the Noise state is unusable; callers must start over.
    pub fn finish(mut self, msg2: &[u8]) -> Result<CompletedHandshake, CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        let len = self
            .state
            .read_message(msg2, &mut payload)
            .map_err(CryptoError::Noise)?;
        payload.truncate(len);

        Ok(CompletedHandshake {
            remote_static: remote_static(&self.state)?,
            payload,
            session: into_session(&self.state, true)?,
        })
    }
}

/// Responder side of the Noise_IX handshake, after reading message 1.
pub struct HandshakeResponder {
    state: HandshakeState,
    remote_static: [u8; 32],
}

impl HandshakeResponder {
    /// Read the initiator's message 1.
    ///
    /// Returns the responder state and the decoded message 1 payload. The
    /// caller verifies the payload's certificate against `remote_static()`
    /// before answering.
    pub fn read(keypair: &Keypair, msg1: &[u8]) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = noise_builder(keypair)?
            .build_responder()
            .map_err(CryptoError::Noise)?;

        let mut payload = vec![0u8; msg1.len()];
        let len = state
            .read_message(msg1, &mut payload)
            .map_err(CryptoError::Noise)?;
        payload.truncate(len);

        let remote_static = remote_static(&state)?;
        Ok((
            Self {
                state,
                remote_static,
            },
            payload,
        ))
    }

    /// The initiator's static public key, as proven by message 1.
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.remote_static
    }

    /// Write message 2 carrying `payload` and derive the session.
    pub fn reply(mut self, payload: &[u8]) -> Result<(CryptoSession, Vec<u8>), CryptoError> {
        let mut msg2 = vec![0u8; NOISE_MAX_MESSAGE];
        let len = self
            .state
            .write_message(payload, &mut msg2)
            .map_err(CryptoError::Noise)?;
        msg2.truncate(len);

        Ok((into_session(&self.state, false)?, msg2))
    }
}

/// Result of a completed initiator handshake.
pub struct CompletedHandshake {
    /// The responder's static public key.
    pub remote_static: [u8; 32],
    /// The decoded message 2 payload.
    pub payload: Vec<u8>,
    pub session: CryptoSession,
}

// ── Replay Window ─────────────────────────────────────────────────────────────

/// Sliding-window replay protection (RFC 6479 style).
///
/// Tracks the highest seen counter and a bitmap of the last 2048 counters.
/// Rejects duplicates and counters that fall behind the window.
pub const WINDOW_SIZE: u64 = 2048;

pub struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>, // 2048 bits = 32 u64s
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            highest: 0,
            bitmap: vec![0u64; (WINDOW_SIZE / 64) as usize],
        }
    }

    /// Returns true if the counter is acceptable (not replayed, not too old).
    pub fn check(&self, counter: u64) -> bool {
        if counter.saturating_add(WINDOW_SIZE) <= self.highest {
            return false; // too old
        }
        if counter > self.highest {
            return true; // ahead of window
        }
        let diff = self.highest - counter;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    /// Mark a counter as seen. Call after successful decrypt.
    pub fn mark(&mut self, counter: u64) {
        if counter > self.highest {
            let shift = counter - self.highest;
            self.shift_window(shift);
            self.highest = counter;
        }
        let diff = self.highest - counter;
        if diff >= WINDOW_SIZE {
            return;
        }
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Once the send counter reaches this value the router starts a rekey.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// A completed session, ready for packet encryption and decryption.
///
/// Wire format per encrypted datagram:
///   [16-byte header, counter = nonce] [ChaCha20-Poly1305 ciphertext + 16-byte tag]
///
/// The header is authenticated as associated data, so the receiver's index
/// and the message type can't be altered in flight.
///
/// Encryption is safe from any thread: the send counter is atomic.
/// Decryption serializes on the replay-window lock, so each session checks,
/// decrypts, and marks one counter at a time.
pub struct CryptoSession {
    session_id: [u8; 32],
    send: ChaCha20Poly1305,
    recv: ChaCha20Poly1305,
    send_counter: AtomicU64,
    recv_window: Mutex<ReplayWindow>,
}

fn aead_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce::from(nonce)
}

impl CryptoSession {
    fn new(session_id: [u8; 32], send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            session_id,
            send: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_counter: AtomicU64::new(0),
            recv_window: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Stable identifier, identical on both sides, derived from the
    /// Noise handshake hash.
    pub fn session_id(&self) -> &[u8; 32] {
        &self.session_id
    }

    /// Number of counters consumed so far.
    pub fn messages_sent(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    pub fn needs_rekey(&self) -> bool {
        self.messages_sent() >= REKEY_AFTER_MESSAGES
    }

    /// Encrypt `plaintext` into a complete datagram addressed to the peer's
    /// `remote_index`.
    ///
    /// Fails with `ResourceExhausted` once the counter space is used up;
    /// the session must then be torn down and renegotiated.
    pub fn encrypt(
        &self,
        message_type: MessageType,
        subtype: u8,
        remote_index: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let previous = self
            .send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c < u64::MAX).then(|| c + 1)
            })
            .map_err(|_| CryptoError::ResourceExhausted)?;
        let counter = previous + 1;

        let header = Header::new(message_type, subtype, remote_index, counter).encode();
        let ciphertext = self
            .send
            .encrypt(
                &aead_nonce(counter),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| CryptoError::AuthFailed)?;

        let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a complete datagram whose header has already been parsed.
    ///
    /// Checks the replay window, verifies the tag with the header as
    /// associated data, and only then marks the counter as seen.
    pub fn decrypt(&self, datagram: &[u8], counter: u64) -> Result<Vec<u8>, CryptoError> {
        if datagram.len() < HEADER_LEN + 16 {
            return Err(CryptoError::TooShort);
        }
        let (header, ciphertext) = datagram.split_at(HEADER_LEN);

        let mut window = self.recv_window.lock();
        if !window.check(counter) {
            return Err(CryptoError::ReplayDetected);
        }

        let plaintext = self
            .recv
            .decrypt(
                &aead_nonce(counter),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::AuthFailed)?;

        window.mark(counter);
        Ok(plaintext)
    }

    /// Move the send counter. Used to exercise counter exhaustion.
    #[doc(hidden)]
    pub fn set_send_counter(&self, value: u64) {
        self.send_counter.store(value, Ordering::Release);
    }
}

impl std::fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession")
            .field("session_id", &hex::encode(&self.session_id[..8]))
            .field("messages_sent", &self.messages_sent())
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake not finished")]
    HandshakeIncomplete,

    #[error("peer did not present a static key")]
    MissingRemoteStatic,

    #[error("ciphertext too short (need at least header + 16-byte tag)")]
    TooShort,

    #[error("replayed or too-old counter")]
    ReplayDetected,

    #[error("authentication tag mismatch")]
    AuthFailed,

    #[error("send counter exhausted, session must be rekeyed")]
    ResourceExhausted,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

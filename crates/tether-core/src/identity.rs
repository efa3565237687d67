//! Node identity: who a peer is, and how we prove who we are.
//!
//! The engine only ever talks to [`IdentityProvider`]. Certificate bytes are
//! opaque to it; the provider turns them into a [`PeerIdentity`] or refuses.
//!
//! The bundled implementation, [`PkiIdentity`], uses a deliberately small
//! certificate: a JSON document naming the node, its virtual address and
//! its X25519 static key, signed by an Ed25519 certificate authority.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;
use ip_network::Ipv4Network;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Keypair;

// ── Identity capability ───────────────────────────────────────────────────────

/// A verified peer. Produced only by an [`IdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub name: String,
    pub vpn_addr: Ipv4Addr,
    pub vpn_network: Ipv4Network,
    /// X25519 static key the peer must prove possession of in the handshake.
    pub public_key: [u8; 32],
    /// Unix seconds.
    pub not_before: u64,
    /// Unix seconds.
    pub not_after: u64,
}

impl PeerIdentity {
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        let now = unix_secs(now);
        self.not_before <= now && now <= self.not_after
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Verify a peer certificate and extract its identity.
    fn verify(&self, cert: &[u8], now: SystemTime) -> Result<PeerIdentity, VerificationError>;

    /// Our own certificate, sent in every handshake message.
    fn local_certificate(&self) -> &[u8];

    fn local_identity(&self) -> &PeerIdentity;

    /// Static key that authenticates our handshake messages.
    fn static_keypair(&self) -> &Keypair;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("malformed certificate: {0}")]
    Malformed(String),

    #[error("certificate issued by an untrusted authority")]
    UntrustedIssuer,

    #[error("certificate signature does not verify")]
    BadSignature,

    #[error("certificate not valid until {0}")]
    NotYetValid(u64),

    #[error("certificate expired at {0}")]
    Expired(u64),
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

// ── Certificate ───────────────────────────────────────────────────────────────

/// The signed part of a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateDetails {
    pub name: String,
    pub vpn_addr: Ipv4Addr,
    pub vpn_prefix: u8,
    /// Hex X25519 public key.
    pub public_key: String,
    pub not_before: u64,
    pub not_after: u64,
    /// Hex Ed25519 verifying key of the issuing CA.
    pub issuer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub details: CertificateDetails,
    /// Hex Ed25519 signature over the JSON encoding of `details`.
    pub signature: String,
}

impl Certificate {
    pub fn to_bytes(&self) -> Vec<u8> {
        // A struct of strings and integers always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VerificationError> {
        serde_json::from_slice(bytes).map_err(|e| VerificationError::Malformed(e.to_string()))
    }

    fn signed_bytes(details: &CertificateDetails) -> Vec<u8> {
        serde_json::to_vec(details).unwrap_or_default()
    }

    /// Check the certificate against a CA key and a point in time.
    pub fn verify(
        &self,
        ca: &VerifyingKey,
        now: SystemTime,
    ) -> Result<PeerIdentity, VerificationError> {
        let d = &self.details;
        if d.issuer != hex::encode(ca.as_bytes()) {
            return Err(VerificationError::UntrustedIssuer);
        }

        let sig_bytes = hex::decode(&self.signature)
            .map_err(|e| VerificationError::Malformed(format!("signature: {e}")))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|e| VerificationError::Malformed(format!("signature: {e}")))?;
        ca.verify(&Self::signed_bytes(d), &signature)
            .map_err(|_| VerificationError::BadSignature)?;

        let now = unix_secs(now);
        if now < d.not_before {
            return Err(VerificationError::NotYetValid(d.not_before));
        }
        if now > d.not_after {
            return Err(VerificationError::Expired(d.not_after));
        }

        let public_key: [u8; 32] = hex::decode(&d.public_key)
            .ok()
            .and_then(|k| k.try_into().ok())
            .ok_or_else(|| VerificationError::Malformed("public key".into()))?;
        if d.vpn_prefix > 32 {
            return Err(VerificationError::Malformed(format!(
                "vpn prefix /{}",
                d.vpn_prefix
            )));
        }
        let vpn_network = Ipv4Network::new_truncate(d.vpn_addr, d.vpn_prefix)
            .map_err(|e| VerificationError::Malformed(e.to_string()))?;

        Ok(PeerIdentity {
            name: d.name.clone(),
            vpn_addr: d.vpn_addr,
            vpn_network,
            public_key,
            not_before: d.not_before,
            not_after: d.not_after,
        })
    }
}

// ── Certificate authority ─────────────────────────────────────────────────────

/// Issues node certificates. Used by provisioning tooling and tests.
pub struct CertificateAuthority {
    signing_key: SigningKey,
}

impl CertificateAuthority {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Raw signing key, for persisting the CA.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issue(
        &self,
        name: &str,
        vpn_addr: Ipv4Addr,
        vpn_prefix: u8,
        public_key: &[u8; 32],
        not_before: u64,
        not_after: u64,
    ) -> Certificate {
        let details = CertificateDetails {
            name: name.to_string(),
            vpn_addr,
            vpn_prefix,
            public_key: hex::encode(public_key),
            not_before,
            not_after,
            issuer: hex::encode(self.verifying_key().as_bytes()),
        };
        let signature = self.signing_key.sign(&Certificate::signed_bytes(&details));
        Certificate {
            details,
            signature: hex::encode(signature.to_bytes()),
        }
    }
}

// ── PKI identity provider ─────────────────────────────────────────────────────

/// Identity backed by a CA key, our certificate, and our static key.
pub struct PkiIdentity {
    ca: VerifyingKey,
    cert_bytes: Vec<u8>,
    identity: PeerIdentity,
    keypair: Keypair,
}

impl PkiIdentity {
    /// Build from in-memory material. Our own certificate must verify and
    /// must carry our static public key.
    pub fn new(
        ca: VerifyingKey,
        cert: &Certificate,
        keypair: Keypair,
        now: SystemTime,
    ) -> Result<Self, PkiError> {
        let identity = cert.verify(&ca, now)?;
        if identity.public_key != keypair.public {
            return Err(PkiError::KeyMismatch);
        }
        Ok(Self {
            ca,
            cert_bytes: cert.to_bytes(),
            identity,
            keypair,
        })
    }

    /// Load `pki.ca` (hex verifying key), `pki.cert` (JSON certificate) and
    /// `pki.key` (hex X25519 private key) from disk.
    pub fn load(ca_path: &Path, cert_path: &Path, key_path: &Path) -> Result<Self, PkiError> {
        let ca_bytes: [u8; 32] = read_hex(ca_path)?
            .try_into()
            .map_err(|_| PkiError::Invalid(ca_path.to_path_buf(), "expected 32 bytes".into()))?;
        let ca = VerifyingKey::from_bytes(&ca_bytes)
            .map_err(|e| PkiError::Invalid(ca_path.to_path_buf(), e.to_string()))?;

        let cert_text = std::fs::read(cert_path)
            .map_err(|e| PkiError::ReadFailed(cert_path.to_path_buf(), e))?;
        let cert = Certificate::from_bytes(&cert_text)?;

        let key: [u8; 32] = read_hex(key_path)?
            .try_into()
            .map_err(|_| PkiError::Invalid(key_path.to_path_buf(), "expected 32 bytes".into()))?;

        Self::new(ca, &cert, Keypair::from_private(key), SystemTime::now())
    }
}

fn read_hex(path: &Path) -> Result<Vec<u8>, PkiError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PkiError::ReadFailed(path.to_path_buf(), e))?;
    hex::decode(text.trim()).map_err(|e| PkiError::Invalid(path.to_path_buf(), e.to_string()))
}

impl IdentityProvider for PkiIdentity {
    fn verify(&self, cert: &[u8], now: SystemTime) -> Result<PeerIdentity, VerificationError> {
        Certificate::from_bytes(cert)?.verify(&self.ca, now)
    }

    fn local_certificate(&self) -> &[u8] {
        &self.cert_bytes
    }

    fn local_identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn static_keypair(&self) -> &Keypair {
        &self.keypair
    }
}

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),

    #[error("invalid key material in {0}: {1}")]
    Invalid(PathBuf, String),

    #[error("own certificate rejected: {0}")]
    Certificate(#[from] VerificationError),

    #[error("certificate public key does not match the static key")]
    KeyMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! tether-core: wire format, cryptographic primitives, identity and config.
//! All other Tether crates depend on this one.

pub mod config;
pub mod crypto;
pub mod identity;
pub mod wire;

pub use crypto::{CryptoError, CryptoSession, Keypair};
pub use identity::{IdentityProvider, PeerIdentity, VerificationError};
pub use wire::{Header, MessageType, WireError};

//! Engine error taxonomy.
//!
//! Every per-packet failure is local: the caller drops the packet, logs at
//! `trace`/`debug`, and carries on. Only `ResourceExhausted` affects a
//! session beyond the packet that hit it.

use std::net::Ipv4Addr;

use tether_core::{CryptoError, WireError};

use crate::firewall::{Direction, RuleError};
use crate::handshake::HandshakeError;
use crate::hostmap::HostMapError;
use crate::packet::PacketError;
use crate::resolver::StaticMapError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("authentication failed")]
    AuthFailed,

    #[error("replayed or too-old counter")]
    ReplayDetected,

    #[error("session counter exhausted")]
    ResourceExhausted,

    #[error("no session for index {0}")]
    UnknownIndex(u32),

    #[error("no session with {0}")]
    NoSession(Ipv4Addr),

    #[error("no known address for {0}")]
    NoRemote(Ipv4Addr),

    #[error("inner source {claimed} is not peer {peer}")]
    Spoofed { claimed: Ipv4Addr, peer: Ipv4Addr },

    #[error("denied by {0:?} firewall")]
    FirewallDenied(Direction),

    #[error("{0} is outside the overlay network")]
    NotInNetwork(Ipv4Addr),

    #[error("packet addressed to this node")]
    ToSelf,

    #[error(transparent)]
    HostMap(#[from] HostMapError),

    #[error("invalid firewall rule: {0}")]
    Rule(#[from] RuleError),

    #[error(transparent)]
    StaticMap(#[from] StaticMapError),
}

impl EngineError {
    /// True if the session that produced this error is unusable.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, EngineError::ResourceExhausted)
    }
}

impl From<WireError> for EngineError {
    fn from(e: WireError) -> Self {
        EngineError::Malformed(e.to_string())
    }
}

impl From<PacketError> for EngineError {
    fn from(e: PacketError) -> Self {
        EngineError::Malformed(e.to_string())
    }
}

impl From<CryptoError> for EngineError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::ReplayDetected => EngineError::ReplayDetected,
            CryptoError::ResourceExhausted => EngineError::ResourceExhausted,
            CryptoError::TooShort => EngineError::Malformed(e.to_string()),
            _ => EngineError::AuthFailed,
        }
    }
}

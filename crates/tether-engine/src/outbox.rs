//! Effects produced by one engine call.
//!
//! The engine performs no I/O. Every entry point appends datagrams to send
//! and packets to deliver, and the caller flushes them to the socket and the
//! virtual interface.

use std::net::SocketAddr;

use bytes::Bytes;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub dst: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
pub struct Outbox {
    /// Datagrams for the UDP socket.
    pub transmits: Vec<Transmit>,
    /// Decrypted IP packets for the virtual interface.
    pub deliveries: Vec<Vec<u8>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, dst: SocketAddr, payload: impl Into<Bytes>) {
        self.transmits.push(Transmit {
            dst,
            payload: payload.into(),
        });
    }

    pub fn deliver(&mut self, packet: Vec<u8>) {
        self.deliveries.push(packet);
    }

    pub fn is_empty(&self) -> bool {
        self.transmits.is_empty() && self.deliveries.is_empty()
    }

    /// Move everything out, leaving this outbox empty and reusable.
    pub fn take(&mut self) -> Outbox {
        std::mem::take(self)
    }
}

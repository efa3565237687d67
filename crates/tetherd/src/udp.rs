//! Underlay UDP socket, receive workers and the outbox flusher.
//!
//! Every worker owns a clone of the same socket and calls into the shared
//! [`Interface`]. Effects are flushed by whoever produced them: workers
//! flush inline, timer and API effects go through the flusher task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};

use tether_engine::{Interface, Outbox};

/// Largest datagram we accept off the wire.
const MAX_DATAGRAM: usize = 9001;

/// Socket buffer size requested from the kernel. It may grant less.
const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

/// Bind the underlay socket. SO_REUSEADDR, enlarged buffers, nonblocking.
pub fn bind(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
        tracing::warn!(error = %e, "could not enlarge receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
        tracing::warn!(error = %e, "could not enlarge send buffer");
    }
    socket.set_nonblocking(true).context("set_nonblocking")?;
    socket.bind(&addr.into()).context("bind()")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

// ── Flusher ──────────────────────────────────────────────────────────────────

/// Writes an [`Outbox`] to the socket and the virtual interface.
#[derive(Clone)]
pub struct Flusher {
    socket: Arc<UdpSocket>,
    tun_tx: mpsc::Sender<Vec<u8>>,
}

impl Flusher {
    pub fn new(socket: Arc<UdpSocket>, tun_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self { socket, tun_tx }
    }

    /// Packets for the virtual interface never wait: if the writer is
    /// behind, they are dropped.
    pub async fn flush(&self, out: Outbox) {
        for t in out.transmits {
            if let Err(e) = self.socket.send_to(&t.payload, t.dst).await {
                tracing::warn!(dst = %t.dst, error = %e, "send_to failed");
            }
        }
        for packet in out.deliveries {
            match self.tun_tx.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => tracing::trace!("tun queue full, dropping packet"),
                Err(TrySendError::Closed(_)) => tracing::warn!("tun writer gone, dropping packet"),
            }
        }
    }

    /// Drain effects produced off the receive path (timers, API).
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Outbox>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                out = rx.recv() => match out {
                    Some(out) => self.flush(out).await,
                    None => return Ok(()),
                },
            }
        }
    }
}

// ── Receive workers ──────────────────────────────────────────────────────────

pub struct UdpWorker {
    id: usize,
    socket: Arc<UdpSocket>,
    interface: Arc<Interface>,
    flusher: Flusher,
    shutdown: broadcast::Receiver<()>,
}

impl UdpWorker {
    pub fn new(
        id: usize,
        socket: Arc<UdpSocket>,
        interface: Arc<Interface>,
        flusher: Flusher,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            socket,
            interface,
            flusher,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut out = Outbox::new();

        tracing::debug!(worker = self.id, "udp worker starting");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::debug!(worker = self.id, "udp worker shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "recv_from failed");
                            continue;
                        }
                    };

                    if let Err(e) = self.interface.consume_outside(from, &buf[..len], Instant::now(), &mut out) {
                        tracing::trace!(%from, error = %e, "dropped datagram");
                    }
                    if !out.is_empty() {
                        self.flusher.flush(out.take()).await;
                    }
                }
            }
        }
    }
}

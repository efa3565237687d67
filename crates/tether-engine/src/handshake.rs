//! Handshake state machine.
//!
//! Noise IX, two messages:
//!
//! ```text
//!   initiator                                   responder
//!   start: pending host, index I
//!     ── msg1 [hdr idx=0 ctr=1] {cert, I} ──────▶ verify cert, allocate R,
//!                                                  establish host, cache msg2
//!     ◀───── msg2 [hdr idx=I ctr=2] {cert, I, R} ─
//!   verify cert, promote host
//! ```
//!
//! A pending host carries a [`HandshakeAttempt`]. The retransmit tick resends
//! message 1 until the attempt completes or runs out of retries. Both the
//! tick and an arriving message 2 inspect the attempt under the host lock,
//! so whichever gets there first decides: a completed attempt is never
//! resent and an expired one is never completed. While message 2 is being
//! verified outside the lock, a retransmit repeats the original message 1,
//! which the responder answers from its cache.
//!
//! Every message 1 carries the initiator's clock. A responder that already
//! holds a session with the peer only accepts a message 1 stamped later
//! than the one that built that session, so a captured message 1 cannot be
//! replayed to knock out a newer session.
//!
//! When both ends start at once, the end with the numerically lower virtual
//! address yields: it drops its own attempt and answers the peer's.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tether_core::crypto::{self, CompletedHandshake, HandshakeInitiator, HandshakeResponder};
use tether_core::wire::{
    subtype, HandshakePayload, Header, MessageType, HANDSHAKE_MSG_INIT, HANDSHAKE_MSG_RESPONSE,
};
use tether_core::{CryptoError, IdentityProvider, PeerIdentity, VerificationError, WireError};

use crate::hostmap::{CachedResponse, HostInfo, HostMap, HostMapError};
use crate::outbox::Outbox;
use crate::resolver::AddressResolver;

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub try_interval: Duration,
    pub retries: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            try_interval: Duration::from_millis(100),
            retries: 10,
        }
    }
}

/// An outbound handshake in flight.
pub struct HandshakeAttempt {
    /// Taken by message 2 while it is verified.
    pub(crate) noise: Option<HandshakeInitiator>,
    /// `None` means message 1 must be rebuilt.
    pub(crate) msg1: Option<Bytes>,
    pub(crate) attempts: u32,
    pub(crate) next_retry_at: Instant,
    pub(crate) expired: bool,
}

impl HandshakeAttempt {
    fn new(now: Instant) -> Self {
        Self {
            noise: None,
            msg1: None,
            attempts: 0,
            next_retry_at: now,
            expired: false,
        }
    }
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    /// A session is up. The caller flushes the host's buffered packet.
    Established(Arc<HostInfo>),
    /// A duplicate message 1 was answered from cache.
    Resent,
}

enum Due {
    Send,
    Expire,
}

pub struct HandshakeManager {
    identity: Arc<dyn IdentityProvider>,
    hostmap: Arc<HostMap>,
    resolver: Arc<dyn AddressResolver>,
    config: HandshakeConfig,
}

impl HandshakeManager {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        hostmap: Arc<HostMap>,
        resolver: Arc<dyn AddressResolver>,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            identity,
            hostmap,
            resolver,
            config,
        }
    }

    fn local_vpn_ip(&self) -> Ipv4Addr {
        self.identity.local_identity().vpn_addr
    }

    // ── Initiator ─────────────────────────────────────────────────────────────

    /// Start a handshake with `vpn_ip`, buffering `packet` until it completes.
    ///
    /// If one is already in flight, the packet replaces whatever that attempt
    /// had buffered and `AlreadyInProgress` carries the existing host.
    pub fn start(
        &self,
        vpn_ip: Ipv4Addr,
        packet: Option<Vec<u8>>,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<Arc<HostInfo>, HandshakeError> {
        let host = Arc::new(HostInfo::new(vpn_ip, self.hostmap.allocate_index(), now));
        {
            let mut st = host.lock();
            st.handshake = Some(HandshakeAttempt::new(now));
            st.pending_packet = packet;
        }

        match self.hostmap.add_pending(&host) {
            Ok(()) => {}
            Err(HostMapError::PendingExists(existing)) => {
                if let Some(packet) = host.lock().pending_packet.take() {
                    existing.lock().pending_packet = Some(packet);
                }
                return Err(HandshakeError::AlreadyInProgress(existing));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(%vpn_ip, local_index = host.local_index, "starting handshake");
        self.send_attempt(&host, now, out);
        Ok(host)
    }

    /// Resend message 1 for attempts that are due; expire exhausted ones.
    /// Returns how many attempts expired.
    pub fn retransmit_tick(&self, now: Instant, out: &mut Outbox) -> usize {
        let mut expired = 0;
        for host in self.hostmap.pending_hosts() {
            let due = {
                let mut st = host.lock();
                match st.handshake.as_mut() {
                    Some(a) if !a.expired && a.next_retry_at <= now => {
                        if a.attempts >= self.config.retries {
                            a.expired = true;
                            Some(Due::Expire)
                        } else {
                            Some(Due::Send)
                        }
                    }
                    _ => None,
                }
            };

            match due {
                Some(Due::Send) => self.send_attempt(&host, now, out),
                Some(Due::Expire) => {
                    if self.hostmap.remove_host(&host) {
                        expired += 1;
                        tracing::debug!(
                            vpn_ip = %host.vpn_ip,
                            local_index = host.local_index,
                            "handshake timed out"
                        );
                    }
                }
                None => {}
            }
        }
        expired
    }

    fn candidates(&self, vpn_ip: Ipv4Addr) -> Vec<SocketAddr> {
        let mut addrs = Vec::new();
        // A rekey goes to where the peer is now.
        if let Some(remote) = self.hostmap.query_vpn_ip(vpn_ip).and_then(|h| h.remote()) {
            addrs.push(remote);
        }
        for addr in self.resolver.resolve(vpn_ip) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }

    fn send_attempt(&self, host: &Arc<HostInfo>, now: Instant, out: &mut Outbox) {
        let candidates = self.candidates(host.vpn_ip);

        let msg1 = {
            let mut st = host.lock();
            let Some(attempt) = st.handshake.as_mut() else {
                return;
            };
            if attempt.expired {
                return;
            }
            if attempt.msg1.is_none() {
                match self.build_msg1(host.local_index) {
                    Ok((noise, msg1)) => {
                        attempt.noise = Some(noise);
                        attempt.msg1 = Some(msg1);
                    }
                    Err(e) => {
                        tracing::warn!(vpn_ip = %host.vpn_ip, error = %e, "failed to build handshake");
                        return;
                    }
                }
            }
            attempt.attempts += 1;
            attempt.next_retry_at = now + self.config.try_interval;
            match &attempt.msg1 {
                Some(m) => m.clone(),
                None => return,
            }
        };

        if candidates.is_empty() {
            tracing::debug!(vpn_ip = %host.vpn_ip, "no known address for handshake");
        }
        for addr in candidates {
            tracing::trace!(vpn_ip = %host.vpn_ip, remote = %addr, "sending handshake msg1");
            out.send(addr, msg1.clone());
        }
    }

    fn build_msg1(&self, local_index: u32) -> Result<(HandshakeInitiator, Bytes), HandshakeError> {
        let payload =
            HandshakePayload::new(self.identity.local_certificate(), local_index, 0, unix_nanos())
                .to_bytes()?;
        let (noise, body) = HandshakeInitiator::new(self.identity.static_keypair(), &payload)?;

        let header = Header::new(
            MessageType::Handshake,
            subtype::HANDSHAKE_IX,
            0,
            HANDSHAKE_MSG_INIT,
        );
        Ok((noise, frame(header, &body)))
    }

    /// Message 2 arrived for one of our pending attempts.
    pub fn handle_msg2(
        &self,
        from: SocketAddr,
        header: &Header,
        body: &[u8],
        now: Instant,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let index = header.remote_index;
        let Some(host) = self.hostmap.query_pending_index(index) else {
            if self.hostmap.query_index(index).is_some() {
                return Err(HandshakeError::AlreadyEstablished(index));
            }
            return Err(HandshakeError::UnknownIndex(index));
        };

        let noise = {
            let mut st = host.lock();
            match st.handshake.as_mut() {
                Some(a) if !a.expired => a.noise.take(),
                _ => None,
            }
        }
        .ok_or(HandshakeError::NoState(index))?;

        let (done, payload, peer) = match self.finish_initiator(&host, noise, body) {
            Ok(v) => v,
            Err(e) => {
                // The Noise state is spent; the next retry starts over.
                if let Some(a) = host.lock().handshake.as_mut() {
                    a.msg1 = None;
                }
                return Err(e);
            }
        };

        if peer.vpn_addr != host.vpn_ip {
            self.hostmap.remove_host(&host);
            return Err(HandshakeError::WrongPeer {
                expected: host.vpn_ip,
                actual: peer.vpn_addr,
            });
        }

        {
            let mut st = host.lock();
            if st.handshake.take().is_none() {
                return Err(HandshakeError::NoState(index));
            }
            st.remote = Some(from);
            st.remote_index = payload.responder_index;
            st.identity = Some(peer);
            st.session = Some(Arc::new(done.session));
            st.peer_time = payload.time;
            st.last_seen = now;
            st.probe_sent_at = None;
        }

        let replaced = self.hostmap.promote(&host)?;
        tracing::info!(
            vpn_ip = %host.vpn_ip,
            local_index = host.local_index,
            remote_index = payload.responder_index,
            remote = %from,
            rekey = replaced.is_some(),
            "tunnel established (initiator)"
        );
        Ok(HandshakeOutcome::Established(host))
    }

    fn finish_initiator(
        &self,
        host: &HostInfo,
        noise: HandshakeInitiator,
        body: &[u8],
    ) -> Result<(CompletedHandshake, HandshakePayload, PeerIdentity), HandshakeError> {
        let done = noise
            .finish(body)
            .map_err(|e| HandshakeError::InvalidAuth(e.to_string()))?;
        let payload = HandshakePayload::from_bytes(&done.payload)?;
        if payload.initiator_index != host.local_index {
            return Err(HandshakeError::Malformed(format!(
                "response echoes index {} instead of {}",
                payload.initiator_index, host.local_index
            )));
        }
        if payload.responder_index == 0 {
            return Err(HandshakeError::Malformed("responder index is zero".into()));
        }
        let peer = self.verify_peer(&payload, &done.remote_static)?;
        Ok((done, payload, peer))
    }

    // ── Responder ─────────────────────────────────────────────────────────────

    /// Message 1 arrived from a peer.
    pub fn handle_msg1(
        &self,
        from: SocketAddr,
        datagram: &[u8],
        body: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let (responder, payload_bytes) =
            HandshakeResponder::read(self.identity.static_keypair(), body)
                .map_err(|e| HandshakeError::InvalidAuth(e.to_string()))?;
        let payload = HandshakePayload::from_bytes(&payload_bytes)?;
        if payload.initiator_index == 0 {
            return Err(HandshakeError::Malformed("initiator index is zero".into()));
        }
        let peer = self.verify_peer(&payload, responder.remote_static())?;
        let peer_vpn = peer.vpn_addr;
        let msg1_hash = crypto::hash(datagram);

        if let Some(existing) = self.hostmap.query_vpn_ip(peer_vpn) {
            let st = existing.lock();
            if let Some(cached) = &st.cached_response {
                if cached.msg1_hash == msg1_hash {
                    let msg2 = cached.msg2.clone();
                    drop(st);
                    tracing::debug!(vpn_ip = %peer_vpn, remote = %from, "resending cached handshake response");
                    out.send(from, msg2);
                    return Ok(HandshakeOutcome::Resent);
                }
            }
            if st.ignored_initiators.contains(&payload.initiator_index) {
                return Err(HandshakeError::Superseded(peer_vpn));
            }
            if payload.time <= st.peer_time {
                tracing::debug!(vpn_ip = %peer_vpn, remote = %from, "stale handshake");
                return Err(HandshakeError::Replayed(peer_vpn));
            }
        }

        let mut carried = None;
        if let Some(pending) = self.hostmap.query_pending_vpn_ip(peer_vpn) {
            if self.local_vpn_ip() > peer_vpn {
                pending.lock().ignore_initiator(payload.initiator_index);
                tracing::debug!(vpn_ip = %peer_vpn, "simultaneous handshake, keeping ours");
                return Err(HandshakeError::Superseded(peer_vpn));
            }
            {
                let mut st = pending.lock();
                st.handshake = None;
                carried = st.pending_packet.take();
            }
            self.hostmap.remove_host(&pending);
            tracing::debug!(vpn_ip = %peer_vpn, "simultaneous handshake, yielding");
        }

        let local_index = self.hostmap.allocate_index();
        let reply = HandshakePayload::new(
            self.identity.local_certificate(),
            payload.initiator_index,
            local_index,
            unix_nanos(),
        )
        .to_bytes()?;
        let (session, body2) = responder.reply(&reply)?;
        let header = Header::new(
            MessageType::Handshake,
            subtype::HANDSHAKE_IX,
            payload.initiator_index,
            HANDSHAKE_MSG_RESPONSE,
        );
        let msg2 = frame(header, &body2);

        let host = Arc::new(HostInfo::new(peer_vpn, local_index, now));
        {
            let mut st = host.lock();
            st.remote = Some(from);
            st.remote_index = payload.initiator_index;
            st.identity = Some(peer);
            st.session = Some(Arc::new(session));
            st.peer_time = payload.time;
            st.cached_response = Some(CachedResponse {
                msg1_hash,
                msg2: msg2.clone(),
            });
            st.pending_packet = carried;
        }
        let replaced = self.hostmap.add_established(&host)?;

        out.send(from, msg2);
        tracing::info!(
            vpn_ip = %peer_vpn,
            local_index,
            remote_index = payload.initiator_index,
            remote = %from,
            rekey = replaced.is_some(),
            "tunnel established (responder)"
        );
        Ok(HandshakeOutcome::Established(host))
    }

    fn verify_peer(
        &self,
        payload: &HandshakePayload,
        remote_static: &[u8; 32],
    ) -> Result<PeerIdentity, HandshakeError> {
        let cert = payload.cert_bytes()?;
        let peer = self.identity.verify(&cert, SystemTime::now())?;
        if &peer.public_key != remote_static {
            return Err(HandshakeError::InvalidAuth(
                "certificate key does not match handshake key".into(),
            ));
        }
        if peer.vpn_addr == self.local_vpn_ip() {
            return Err(HandshakeError::InvalidAuth(format!(
                "peer claims our own address {}",
                peer.vpn_addr
            )));
        }
        Ok(peer)
    }
}

fn frame(header: Header, body: &[u8]) -> Bytes {
    let mut datagram = Vec::with_capacity(tether_core::wire::HEADER_LEN + body.len());
    datagram.extend_from_slice(&header.encode());
    datagram.extend_from_slice(body);
    Bytes::from(datagram)
}

fn unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("handshake authentication failed: {0}")]
    InvalidAuth(String),

    #[error("expired: {0}")]
    Expired(String),

    #[error("handshake already in progress with {}", .0.vpn_ip)]
    AlreadyInProgress(Arc<HostInfo>),

    #[error("index {0} is already established")]
    AlreadyEstablished(u32),

    #[error("no pending handshake for index {0}")]
    UnknownIndex(u32),

    #[error("no handshake state for index {0}")]
    NoState(u32),

    #[error("handshake from {0} superseded by ours")]
    Superseded(Ipv4Addr),

    #[error("handshake from {0} is older than the current session")]
    Replayed(Ipv4Addr),

    #[error("expected certificate for {expected}, got {actual}")]
    WrongPeer { expected: Ipv4Addr, actual: Ipv4Addr },

    #[error(transparent)]
    HostMap(#[from] HostMapError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<WireError> for HandshakeError {
    fn from(e: WireError) -> Self {
        HandshakeError::Malformed(e.to_string())
    }
}

impl From<VerificationError> for HandshakeError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::NotYetValid(_) | VerificationError::Expired(_) => {
                HandshakeError::Expired(e.to_string())
            }
            VerificationError::Malformed(_) => HandshakeError::Malformed(e.to_string()),
            VerificationError::UntrustedIssuer | VerificationError::BadSignature => {
                HandshakeError::InvalidAuth(e.to_string())
            }
        }
    }
}

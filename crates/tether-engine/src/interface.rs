//! The router.
//!
//! `Interface` ties the host map, handshakes, sessions and the firewall
//! together. It owns no per-packet state: every call takes the current time
//! and an [`Outbox`] for its effects, so the daemon's workers can call it
//! concurrently and the tests can drive it without sockets.
//!
//! Outbound (`consume_inside`): parse the flow, find the established host
//! for the destination or buffer the packet and start a handshake, then
//! firewall, encrypt, send.
//!
//! Inbound (`consume_outside`): parse the header, hand handshakes to the
//! handshake manager, otherwise find the host by our index, decrypt, note
//! liveness and roaming, then check the inner source and the firewall
//! before delivering. During a rekey the session being replaced still
//! decrypts data, but its control messages are ignored.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use ip_network::Ipv4Network;
use serde::Serialize;
use tether_core::config::TetherConfig;
use tether_core::wire::{subtype, Header, MessageType, HANDSHAKE_MSG_INIT, HANDSHAKE_MSG_RESPONSE};
use tether_core::{IdentityProvider, PeerIdentity};

use crate::connection_manager::ConnectionManager;
use crate::error::EngineError;
use crate::firewall::{Direction, Firewall};
use crate::handshake::{HandshakeConfig, HandshakeError, HandshakeManager, HandshakeOutcome};
use crate::hostmap::{HostInfo, HostMap, HostMapError, SweepReport};
use crate::outbox::Outbox;
use crate::packet::FlowKey;
use crate::resolver::AddressResolver;

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub vpn_ip: String,
    pub vpn_network: String,
    pub hosts: usize,
    pub pending: usize,
    pub tracked_flows: usize,
}

pub struct Interface {
    identity: Arc<dyn IdentityProvider>,
    hostmap: Arc<HostMap>,
    handshakes: HandshakeManager,
    firewall: Firewall,
    connections: ConnectionManager,
    vpn_ip: Ipv4Addr,
    vpn_network: Ipv4Network,
}

impl Interface {
    pub fn new(
        config: &TetherConfig,
        identity: Arc<dyn IdentityProvider>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<Self, EngineError> {
        let firewall = Firewall::from_config(&config.firewall)?;
        let hostmap = Arc::new(HostMap::new());
        let handshakes = HandshakeManager::new(
            identity.clone(),
            hostmap.clone(),
            resolver,
            HandshakeConfig {
                try_interval: config.handshake_try_interval(),
                retries: config.handshakes.retries,
            },
        );
        let connections = ConnectionManager::new(
            hostmap.clone(),
            config.alive_interval(),
            config.pending_deletion_interval(),
        );
        let local = identity.local_identity();
        let (vpn_ip, vpn_network) = (local.vpn_addr, local.vpn_network);

        Ok(Self {
            identity,
            hostmap,
            handshakes,
            firewall,
            connections,
            vpn_ip,
            vpn_network,
        })
    }

    pub fn hostmap(&self) -> &Arc<HostMap> {
        &self.hostmap
    }

    pub fn vpn_ip(&self) -> Ipv4Addr {
        self.vpn_ip
    }

    pub fn local_identity(&self) -> &PeerIdentity {
        self.identity.local_identity()
    }

    pub fn status(&self) -> InterfaceStatus {
        InterfaceStatus {
            name: self.identity.local_identity().name.clone(),
            vpn_ip: self.vpn_ip.to_string(),
            vpn_network: format!(
                "{}/{}",
                self.vpn_network.network_address(),
                self.vpn_network.netmask()
            ),
            hosts: self.hostmap.len(),
            pending: self.hostmap.pending_len(),
            tracked_flows: self.firewall.tracked_flows(),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// A packet read from the local virtual interface.
    pub fn consume_inside(
        &self,
        packet: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let flow = FlowKey::outbound(packet)?;
        let dst = flow.remote_ip;
        if dst == self.vpn_ip {
            return Err(EngineError::ToSelf);
        }
        if !self.vpn_network.contains(dst) {
            return Err(EngineError::NotInNetwork(dst));
        }

        let Some(host) = self.hostmap.query_vpn_ip(dst) else {
            return match self.handshakes.start(dst, Some(packet.to_vec()), now, out) {
                Ok(_) | Err(HandshakeError::AlreadyInProgress(_)) => Ok(()),
                Err(e) => Err(e.into()),
            };
        };
        self.send_packet(&host, &flow, packet, now, out)
    }

    fn send_packet(
        &self,
        host: &Arc<HostInfo>,
        flow: &FlowKey,
        packet: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        if !self.firewall.authorize(Direction::Outbound, flow, now) {
            return Err(EngineError::FirewallDenied(Direction::Outbound));
        }
        self.send_encrypted(host, MessageType::Message, subtype::NONE, packet, now, out)
    }

    fn encrypt_for(
        &self,
        host: &HostInfo,
        message_type: MessageType,
        subtype: u8,
        payload: &[u8],
    ) -> Result<(SocketAddr, Vec<u8>, bool), EngineError> {
        let (session, remote, remote_index) = {
            let st = host.lock();
            (st.session.clone(), st.remote, st.remote_index)
        };
        let session = session.ok_or(EngineError::NoSession(host.vpn_ip))?;
        let remote = remote.ok_or(EngineError::NoRemote(host.vpn_ip))?;
        let datagram = session.encrypt(message_type, subtype, remote_index, payload)?;
        Ok((remote, datagram, session.needs_rekey()))
    }

    /// Encrypt and queue a datagram for an established host. An exhausted
    /// session is torn down and renegotiated.
    fn send_encrypted(
        &self,
        host: &Arc<HostInfo>,
        message_type: MessageType,
        subtype: u8,
        payload: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        match self.encrypt_for(host, message_type, subtype, payload) {
            Ok((remote, datagram, needs_rekey)) => {
                out.send(remote, datagram);
                if needs_rekey {
                    self.rekey(host.vpn_ip, now, out);
                }
                Ok(())
            }
            Err(EngineError::ResourceExhausted) => {
                self.hostmap.remove_host(host);
                tracing::info!(vpn_ip = %host.vpn_ip, "session counter exhausted, renegotiating");
                self.rekey(host.vpn_ip, now, out);
                Err(EngineError::ResourceExhausted)
            }
            Err(e) => Err(e),
        }
    }

    fn rekey(&self, vpn_ip: Ipv4Addr, now: Instant, out: &mut Outbox) {
        if self.hostmap.query_pending_vpn_ip(vpn_ip).is_some() {
            return;
        }
        match self.handshakes.start(vpn_ip, None, now, out) {
            Ok(_) => tracing::debug!(%vpn_ip, "rekeying"),
            Err(HandshakeError::AlreadyInProgress(_)) => {}
            Err(e) => tracing::debug!(%vpn_ip, error = %e, "rekey failed to start"),
        }
    }

    /// Send the packet a host buffered while its handshake was in flight.
    fn flush_pending(&self, host: &Arc<HostInfo>, now: Instant, out: &mut Outbox) {
        let Some(packet) = host.lock().pending_packet.take() else {
            return;
        };
        let result = FlowKey::outbound(&packet)
            .map_err(EngineError::from)
            .and_then(|flow| self.send_packet(host, &flow, &packet, now, out));
        if let Err(e) = result {
            tracing::debug!(vpn_ip = %host.vpn_ip, error = %e, "dropped buffered packet");
        }
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// A datagram read from the UDP socket.
    pub fn consume_outside(
        &self,
        from: SocketAddr,
        datagram: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let (header, body) = Header::parse(datagram)?;

        if header.message_type != MessageType::Handshake {
            return self.consume_encrypted(from, &header, datagram, now, out);
        }

        let outcome = match header.counter {
            HANDSHAKE_MSG_INIT => self.handshakes.handle_msg1(from, datagram, body, now, out)?,
            HANDSHAKE_MSG_RESPONSE => self.handshakes.handle_msg2(from, &header, body, now)?,
            n => return Err(EngineError::Malformed(format!("handshake message {n}"))),
        };
        if let HandshakeOutcome::Established(host) = outcome {
            self.flush_pending(&host, now, out);
        }
        Ok(())
    }

    fn consume_encrypted(
        &self,
        from: SocketAddr,
        header: &Header,
        datagram: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), EngineError> {
        let index = header.remote_index;
        let (host, current) = match self.hostmap.query_index(index) {
            Some(host) => (host, true),
            None => (
                self.hostmap
                    .query_retired_index(index)
                    .ok_or(EngineError::UnknownIndex(index))?,
                false,
            ),
        };
        let session = host.session().ok_or(EngineError::NoSession(host.vpn_ip))?;
        let plaintext = session.decrypt(datagram, header.counter)?;

        let previous = host.mark_seen(from, now);
        if !current {
            if header.message_type != MessageType::Message {
                tracing::trace!(vpn_ip = %host.vpn_ip, "ignoring control message on retired session");
                return Ok(());
            }
        } else if let Some(previous) = previous {
            tracing::info!(vpn_ip = %host.vpn_ip, from = %previous, to = %from, "peer roamed");
        }

        match header.message_type {
            MessageType::Message => {
                let flow = FlowKey::inbound(&plaintext)?;
                if flow.remote_ip != host.vpn_ip {
                    return Err(EngineError::Spoofed {
                        claimed: flow.remote_ip,
                        peer: host.vpn_ip,
                    });
                }
                if !self.firewall.authorize(Direction::Inbound, &flow, now) {
                    return Err(EngineError::FirewallDenied(Direction::Inbound));
                }
                out.deliver(plaintext);
            }
            MessageType::Test => {
                if header.subtype == subtype::TEST_REQUEST {
                    self.send_encrypted(
                        &host,
                        MessageType::Test,
                        subtype::TEST_REPLY,
                        &plaintext,
                        now,
                        out,
                    )?;
                }
            }
            MessageType::CloseTunnel => {
                if self.hostmap.remove_host(&host) {
                    tracing::info!(vpn_ip = %host.vpn_ip, "peer closed tunnel");
                }
            }
            MessageType::Handshake => {}
        }
        Ok(())
    }

    // ── Control ───────────────────────────────────────────────────────────────

    /// Tell the peer the tunnel is gone and forget it, including any
    /// handshake in flight.
    pub fn close_tunnel(&self, vpn_ip: Ipv4Addr, out: &mut Outbox) -> Result<(), EngineError> {
        let removed = self.hostmap.remove_vpn_ip(vpn_ip);
        if removed.is_empty() {
            return Err(HostMapError::NotFound(vpn_ip).into());
        }
        for host in removed.iter().filter(|h| h.is_established()) {
            match self.encrypt_for(host, MessageType::CloseTunnel, subtype::NONE, &[]) {
                Ok((remote, datagram, _)) => out.send(remote, datagram),
                Err(e) => tracing::debug!(%vpn_ip, error = %e, "could not notify peer of close"),
            }
        }
        tracing::info!(%vpn_ip, "tunnel closed");
        Ok(())
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    /// Handshake retransmissions. Returns how many attempts expired.
    pub fn handshake_tick(&self, now: Instant, out: &mut Outbox) -> usize {
        self.handshakes.retransmit_tick(now, out)
    }

    /// Keepalive probes, stale-host removal and conntrack expiry.
    pub fn maintenance_tick(&self, now: Instant, out: &mut Outbox) -> SweepReport {
        let report = self.connections.sweep(now);
        for host in &report.probe {
            if let Err(e) = self.send_encrypted(
                host,
                MessageType::Test,
                subtype::TEST_REQUEST,
                &[],
                now,
                out,
            ) {
                tracing::debug!(vpn_ip = %host.vpn_ip, error = %e, "probe not sent");
            }
        }
        let purged = self.firewall.purge(now);
        if purged > 0 {
            tracing::trace!(purged, "expired conntrack entries");
        }
        report
    }
}

//! Tether integration test harness.
//!
//! Several engines run in one process and exchange datagrams through an
//! in-memory router instead of sockets. Time is a field on the network and
//! only moves when a test advances it, so timer behaviour is exact.
//!
//!   cargo test --test integration
//!
//! Set RUST_LOG=tether_engine=debug to watch handshakes.

use std::collections::{HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use etherparse::{NetSlice, PacketBuilder, SlicedPacket, TransportSlice};
use tether_core::config::{RuleConfig, TetherConfig};
use tether_core::identity::{CertificateAuthority, PkiIdentity};
use tether_core::wire::{Header, MessageType};
use tether_core::{CryptoSession, Keypair};
use tether_engine::{EngineError, HostInfo, Interface, Outbox, StaticHostMap};

mod data;
mod handshake;
mod lifecycle;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const A_VPN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const B_VPN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const C_VPN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

pub fn underlay(vpn: Ipv4Addr) -> SocketAddr {
    let [_, _, _, host] = vpn.octets();
    SocketAddr::from(([192, 168, 0, host], 4242))
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A datagram in flight between two nodes.
#[derive(Debug, Clone)]
pub struct Wire {
    pub from: SocketAddr,
    pub dst: SocketAddr,
    pub payload: Vec<u8>,
}

impl Wire {
    pub fn header(&self) -> Header {
        Header::parse(&self.payload).expect("valid header").0
    }

    pub fn is_handshake(&self, counter: u64) -> bool {
        let h = self.header();
        h.message_type == MessageType::Handshake && h.counter == counter
    }
}

pub struct Node {
    pub vpn: Ipv4Addr,
    pub addr: SocketAddr,
    pub interface: Interface,
    /// Packets the engine handed to the virtual interface.
    pub delivered: Vec<Vec<u8>>,
    /// Errors returned by `consume_outside`.
    pub errors: Vec<EngineError>,
}

impl Node {
    pub fn host(&self, vpn: Ipv4Addr) -> Option<Arc<HostInfo>> {
        self.interface.hostmap().query_vpn_ip(vpn)
    }

    pub fn session(&self, vpn: Ipv4Addr) -> Arc<CryptoSession> {
        self.host(vpn)
            .and_then(|h| h.session())
            .expect("established session")
    }
}

/// Builds nodes that share one CA and one static host map.
pub struct NetBuilder {
    ca: CertificateAuthority,
    resolver: Arc<StaticHostMap>,
    config: TetherConfig,
    nodes: Vec<Node>,
}

impl NetBuilder {
    pub fn new() -> Self {
        init_tracing();
        let mut config = TetherConfig::default();
        config.firewall.inbound = vec![RuleConfig::any()];
        config.handshakes.retries = 3;
        Self {
            ca: CertificateAuthority::generate(),
            resolver: Arc::new(StaticHostMap::new()),
            config,
            nodes: Vec::new(),
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut TetherConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn node(self, vpn: Ipv4Addr) -> Self {
        let now = unix_now();
        self.node_with_validity(vpn, now - 60, now + 3_600, SystemTime::now())
    }

    /// A node whose certificate is valid for `[not_before, not_after]`,
    /// loaded as if the local clock read `loaded_at`.
    pub fn node_with_validity(
        mut self,
        vpn: Ipv4Addr,
        not_before: u64,
        not_after: u64,
        loaded_at: SystemTime,
    ) -> Self {
        let keypair = Keypair::generate();
        let cert = self.ca.issue(
            &format!("node-{}", vpn.octets()[3]),
            vpn,
            24,
            &keypair.public,
            not_before,
            not_after,
        );
        let identity = Arc::new(
            PkiIdentity::new(self.ca.verifying_key(), &cert, keypair, loaded_at)
                .expect("own certificate"),
        );
        let interface = Interface::new(&self.config, identity, self.resolver.clone())
            .expect("interface builds");

        let addr = underlay(vpn);
        self.resolver.set(vpn, vec![addr]);
        self.nodes.push(Node {
            vpn,
            addr,
            interface,
            delivered: Vec::new(),
            errors: Vec::new(),
        });
        self
    }

    pub fn build(self) -> Net {
        Net {
            nodes: self.nodes,
            now: Instant::now(),
            queue: VecDeque::new(),
            unreachable: HashSet::new(),
        }
    }
}

/// The simulated underlay.
pub struct Net {
    pub nodes: Vec<Node>,
    pub now: Instant,
    /// Datagrams sent but not yet delivered.
    pub queue: VecDeque<Wire>,
    /// Nodes cut off from the network in both directions.
    pub unreachable: HashSet<usize>,
}

impl Net {
    pub fn two_nodes() -> Net {
        NetBuilder::new().node(A_VPN).node(B_VPN).build()
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    fn enqueue(&mut self, idx: usize, out: Outbox) {
        let from = self.nodes[idx].addr;
        for t in out.transmits {
            self.queue.push_back(Wire {
                from,
                dst: t.dst,
                payload: t.payload.to_vec(),
            });
        }
        self.nodes[idx].delivered.extend(out.deliveries);
    }

    /// Hand a packet to node `idx` as if read from its virtual interface.
    pub fn send_inside(&mut self, idx: usize, packet: &[u8]) -> Result<(), EngineError> {
        let mut out = Outbox::new();
        let result = self.nodes[idx]
            .interface
            .consume_inside(packet, self.now, &mut out);
        self.enqueue(idx, out);
        result
    }

    /// Deliver one queued datagram. Returns false when the queue is empty.
    pub fn step(&mut self) -> bool {
        let Some(wire) = self.queue.pop_front() else {
            return false;
        };
        self.inject(wire);
        true
    }

    /// Deliver a datagram directly, bypassing the queue.
    pub fn inject(&mut self, wire: Wire) {
        let Some(idx) = self.nodes.iter().position(|n| n.addr == wire.dst) else {
            return;
        };
        let from_idx = self.nodes.iter().position(|n| n.addr == wire.from);
        if self.unreachable.contains(&idx) || from_idx.is_some_and(|i| self.unreachable.contains(&i)) {
            return;
        }
        let mut out = Outbox::new();
        if let Err(e) =
            self.nodes[idx]
                .interface
                .consume_outside(wire.from, &wire.payload, self.now, &mut out)
        {
            self.nodes[idx].errors.push(e);
        }
        self.enqueue(idx, out);
    }

    /// Deliver until the network is quiet.
    pub fn route(&mut self) {
        for _ in 0..10_000 {
            if !self.step() {
                return;
            }
        }
        panic!("datagram storm: network never went quiet");
    }

    pub fn handshake_tick(&mut self) -> usize {
        let mut expired = 0;
        for idx in 0..self.nodes.len() {
            let mut out = Outbox::new();
            expired += self.nodes[idx].interface.handshake_tick(self.now, &mut out);
            self.enqueue(idx, out);
        }
        expired
    }

    pub fn maintenance_tick(&mut self) {
        for idx in 0..self.nodes.len() {
            let mut out = Outbox::new();
            self.nodes[idx].interface.maintenance_tick(self.now, &mut out);
            self.enqueue(idx, out);
        }
    }

    /// Move a node to a new underlay address, as a NAT rebinding would.
    pub fn rebind(&mut self, idx: usize, addr: SocketAddr) {
        self.nodes[idx].addr = addr;
    }

    /// Send a packet from `from` to `to` and route until quiet.
    pub fn establish(&mut self, from: usize, to: usize) {
        let packet = udp_packet(self.nodes[from].vpn, self.nodes[to].vpn, 80, 90, b"hello");
        self.send_inside(from, &packet).expect("outbound accepted");
        self.route();
        assert!(
            self.nodes[from].host(self.nodes[to].vpn).is_some(),
            "tunnel did not establish"
        );
    }
}

// ── Packets ───────────────────────────────────────────────────────────────────

pub fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).udp(sport, dport);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut buf, payload).expect("packet builds");
    buf
}

pub fn tcp_packet(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16) -> Vec<u8> {
    let builder = PacketBuilder::ipv4(src.octets(), dst.octets(), 64).tcp(sport, dport, 1, 1024);
    let mut buf = Vec::with_capacity(builder.size(0));
    builder.write(&mut buf, &[]).expect("packet builds");
    buf
}

/// Decoded UDP packet: source, destination, ports, payload.
pub struct UdpView {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub payload: Vec<u8>,
}

pub fn parse_udp(packet: &[u8]) -> UdpView {
    let sliced = SlicedPacket::from_ip(packet).expect("valid IP packet");
    let Some(NetSlice::Ipv4(ip)) = sliced.net else {
        panic!("not IPv4");
    };
    let Some(TransportSlice::Udp(udp)) = sliced.transport else {
        panic!("not UDP");
    };
    UdpView {
        src: ip.header().source_addr(),
        dst: ip.header().destination_addr(),
        sport: udp.source_port(),
        dport: udp.destination_port(),
        payload: udp.payload().to_vec(),
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after 1970")
        .as_secs()
}

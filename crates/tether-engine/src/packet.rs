//! IPv4 flow extraction.
//!
//! The engine never rewrites packets; it only needs the flow key to run the
//! firewall and to find the destination host. Headers are read through
//! zerocopy views, so nothing is copied beyond the 24 bytes inspected.

use std::net::Ipv4Addr;

use static_assertions::assert_eq_size;
use zerocopy::{FromBytes, FromZeroes};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;

#[derive(Debug, Clone, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct Ipv4Header {
    version_ihl: u8,
    tos: u8,
    total_len: [u8; 2],
    id: [u8; 2],
    flags_fragment: [u8; 2],
    ttl: u8,
    protocol: u8,
    checksum: [u8; 2],
    src: [u8; 4],
    dst: [u8; 4],
}

assert_eq_size!(Ipv4Header, [u8; IPV4_MIN_HEADER]);

/// First four bytes of a TCP or UDP header.
#[derive(Debug, Clone, FromBytes, FromZeroes)]
#[repr(C, packed)]
struct Ports {
    src: [u8; 2],
    dst: [u8; 2],
}

/// A flow as seen from this node: `local` is always our side.
///
/// The same key is produced for both directions of a conversation, which is
/// what lets conntrack authorize replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: u8,
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    /// Non-first fragment: no transport header, ports are zero.
    pub fragment: bool,
}

impl FlowKey {
    /// Parse a packet read from the local virtual interface.
    pub fn outbound(packet: &[u8]) -> Result<Self, PacketError> {
        let p = parse(packet)?;
        Ok(Self {
            protocol: p.protocol,
            local_ip: p.src,
            remote_ip: p.dst,
            local_port: p.src_port,
            remote_port: p.dst_port,
            fragment: p.fragment,
        })
    }

    /// Parse a decrypted packet that arrived from a peer.
    pub fn inbound(packet: &[u8]) -> Result<Self, PacketError> {
        let p = parse(packet)?;
        Ok(Self {
            protocol: p.protocol,
            local_ip: p.dst,
            remote_ip: p.src,
            local_port: p.dst_port,
            remote_port: p.src_port,
            fragment: p.fragment,
        })
    }
}

struct Parsed {
    protocol: u8,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    fragment: bool,
}

fn parse(packet: &[u8]) -> Result<Parsed, PacketError> {
    let ip = Ipv4Header::read_from_prefix(packet).ok_or(PacketError::TooShort(packet.len()))?;

    let version = ip.version_ihl >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }
    let ihl = usize::from(ip.version_ihl & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER || ihl > packet.len() {
        return Err(PacketError::BadHeaderLength(ihl));
    }

    let fragment_offset = u16::from_be_bytes(ip.flags_fragment) & 0x1fff;
    let fragment = fragment_offset != 0;

    let (src_port, dst_port) = match ip.protocol {
        PROTO_TCP | PROTO_UDP if !fragment => {
            let ports = Ports::read_from_prefix(&packet[ihl..])
                .ok_or(PacketError::TooShort(packet.len()))?;
            (u16::from_be_bytes(ports.src), u16::from_be_bytes(ports.dst))
        }
        _ => (0, 0),
    };

    Ok(Parsed {
        protocol: ip.protocol,
        src: Ipv4Addr::from(ip.src),
        dst: Ipv4Addr::from(ip.dst),
        src_port,
        dst_port,
        fragment,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("bad IPv4 header length: {0}")]
    BadHeaderLength(usize),
}

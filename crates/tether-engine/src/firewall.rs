//! Stateful firewall.
//!
//! Rules are a closed set of variants evaluated in order; the first match
//! allows, and running off the end denies. An allowed packet creates a
//! conntrack entry, after which its flow passes in both directions without
//! another rule scan.
//!
//! Port rules match the destination port of the packet: the remote port for
//! outbound traffic, the local port for inbound traffic. Host rules match
//! the remote address. Non-first fragments carry no ports and only match
//! rules with `port = any`.

use std::net::Ipv4Addr;
use std::time::Instant;

use ip_network::Ipv4Network;
use serde::Serialize;
use tether_core::config::{FirewallConfig, PortValue, RuleConfig};

use crate::conntrack::{Conntrack, ConntrackTimeouts};
use crate::packet::{FlowKey, PROTO_ICMP, PROTO_TCP, PROTO_UDP};

// ── Rules ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Any,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    Any,
    /// Inclusive.
    Range(u16, u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSpec {
    Any,
    Network(Ipv4Network),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallRule {
    pub protocol: Protocol,
    pub port: PortSpec,
    pub host: HostSpec,
}

impl Protocol {
    fn matches(self, protocol: u8) -> bool {
        match self {
            Protocol::Any => true,
            Protocol::Tcp => protocol == PROTO_TCP,
            Protocol::Udp => protocol == PROTO_UDP,
            Protocol::Icmp => protocol == PROTO_ICMP,
        }
    }
}

impl PortSpec {
    fn matches(self, port: u16, fragment: bool) -> bool {
        match self {
            PortSpec::Any => true,
            PortSpec::Range(_, _) if fragment => false,
            PortSpec::Range(lo, hi) => lo <= port && port <= hi,
        }
    }
}

impl HostSpec {
    fn matches(self, addr: Ipv4Addr) -> bool {
        match self {
            HostSpec::Any => true,
            HostSpec::Network(net) => net.contains(addr),
        }
    }
}

impl FirewallRule {
    pub const ANY: FirewallRule = FirewallRule {
        protocol: Protocol::Any,
        port: PortSpec::Any,
        host: HostSpec::Any,
    };

    pub fn parse(rule: &RuleConfig) -> Result<Self, RuleError> {
        let protocol = match rule.proto.to_ascii_lowercase().as_str() {
            "any" => Protocol::Any,
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            "icmp" => Protocol::Icmp,
            other => return Err(RuleError::Protocol(other.to_string())),
        };

        let port = match &rule.port {
            PortValue::Number(0) => return Err(RuleError::Port("0".into())),
            PortValue::Number(n) => PortSpec::Range(*n, *n),
            PortValue::Text(text) => parse_port(text)?,
        };

        let host = if rule.host.eq_ignore_ascii_case("any") {
            HostSpec::Any
        } else {
            HostSpec::Network(parse_host(&rule.host)?)
        };

        Ok(Self {
            protocol,
            port,
            host,
        })
    }

    pub fn matches(&self, direction: Direction, flow: &FlowKey) -> bool {
        let dst_port = match direction {
            Direction::Outbound => flow.remote_port,
            Direction::Inbound => flow.local_port,
        };
        self.protocol.matches(flow.protocol)
            && self.port.matches(dst_port, flow.fragment)
            && self.host.matches(flow.remote_ip)
    }
}

fn parse_port(text: &str) -> Result<PortSpec, RuleError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("any") {
        return Ok(PortSpec::Any);
    }
    let bad = || RuleError::Port(text.to_string());
    let (lo, hi) = match text.split_once('-') {
        Some((lo, hi)) => (
            lo.trim().parse::<u16>().map_err(|_| bad())?,
            hi.trim().parse::<u16>().map_err(|_| bad())?,
        ),
        None => {
            let n = text.parse::<u16>().map_err(|_| bad())?;
            (n, n)
        }
    };
    if lo == 0 || lo > hi {
        return Err(bad());
    }
    Ok(PortSpec::Range(lo, hi))
}

fn parse_host(text: &str) -> Result<Ipv4Network, RuleError> {
    let bad = || RuleError::Host(text.to_string());
    let (addr, prefix) = match text.split_once('/') {
        Some((addr, prefix)) => (addr, prefix.parse::<u8>().map_err(|_| bad())?),
        None => (text, 32),
    };
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| bad())?;
    Ipv4Network::new(addr, prefix).map_err(|_| bad())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("unknown protocol {0:?} (expected any, tcp, udp or icmp)")]
    Protocol(String),

    #[error("invalid port {0:?} (expected any, a port, or lo-hi)")]
    Port(String),

    #[error("invalid host {0:?} (expected any or an IPv4 CIDR)")]
    Host(String),
}

// ── Firewall ──────────────────────────────────────────────────────────────────

pub struct Firewall {
    outbound: Vec<FirewallRule>,
    inbound: Vec<FirewallRule>,
    conntrack: Conntrack,
}

impl Firewall {
    pub fn new(
        outbound: Vec<FirewallRule>,
        inbound: Vec<FirewallRule>,
        timeouts: ConntrackTimeouts,
    ) -> Self {
        Self {
            outbound,
            inbound,
            conntrack: Conntrack::new(timeouts),
        }
    }

    pub fn from_config(config: &FirewallConfig) -> Result<Self, RuleError> {
        let outbound = config
            .outbound
            .iter()
            .map(FirewallRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let inbound = config
            .inbound
            .iter()
            .map(FirewallRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(
            outbound,
            inbound,
            ConntrackTimeouts::from(&config.conntrack),
        ))
    }

    /// Decide whether a packet may cross the tunnel boundary.
    pub fn authorize(&self, direction: Direction, flow: &FlowKey, now: Instant) -> bool {
        if self.conntrack.touch(flow, now) {
            return true;
        }

        let rules = match direction {
            Direction::Outbound => &self.outbound,
            Direction::Inbound => &self.inbound,
        };
        if rules.iter().any(|r| r.matches(direction, flow)) {
            self.conntrack.track(*flow, direction, now);
            return true;
        }
        false
    }

    /// Drop idle conntrack entries.
    pub fn purge(&self, now: Instant) -> usize {
        self.conntrack.purge(now)
    }

    pub fn tracked_flows(&self) -> usize {
        self.conntrack.len()
    }
}

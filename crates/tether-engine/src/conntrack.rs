//! Connection tracking.
//!
//! Once a flow is allowed in one direction, its entry authorizes packets of
//! that flow in both directions until it goes idle. Rule changes never
//! revisit tracked flows.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tether_core::config::ConntrackConfig;

use crate::firewall::Direction;
use crate::packet::{FlowKey, PROTO_TCP, PROTO_UDP};

#[derive(Debug, Clone, Copy)]
pub struct ConntrackEntry {
    /// Direction of the packet that created the entry.
    pub direction: Direction,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct ConntrackTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub default: Duration,
}

impl From<&ConntrackConfig> for ConntrackTimeouts {
    fn from(c: &ConntrackConfig) -> Self {
        Self {
            tcp: Duration::from_secs(c.tcp_timeout_secs),
            udp: Duration::from_secs(c.udp_timeout_secs),
            default: Duration::from_secs(c.default_timeout_secs),
        }
    }
}

impl ConntrackTimeouts {
    fn for_protocol(&self, protocol: u8) -> Duration {
        match protocol {
            PROTO_TCP => self.tcp,
            PROTO_UDP => self.udp,
            _ => self.default,
        }
    }
}

pub struct Conntrack {
    flows: DashMap<FlowKey, ConntrackEntry>,
    timeouts: ConntrackTimeouts,
}

impl Conntrack {
    pub fn new(timeouts: ConntrackTimeouts) -> Self {
        Self {
            flows: DashMap::new(),
            timeouts,
        }
    }

    /// If the flow is tracked and still live, refresh it and return true.
    pub fn touch(&self, flow: &FlowKey, now: Instant) -> bool {
        let timeout = self.timeouts.for_protocol(flow.protocol);
        match self.flows.get_mut(flow) {
            Some(mut entry) if now.saturating_duration_since(entry.last_seen) <= timeout => {
                entry.last_seen = now;
                true
            }
            _ => false,
        }
    }

    pub fn track(&self, flow: FlowKey, direction: Direction, now: Instant) {
        self.flows.insert(
            flow,
            ConntrackEntry {
                direction,
                last_seen: now,
            },
        );
    }

    pub fn get(&self, flow: &FlowKey) -> Option<ConntrackEntry> {
        self.flows.get(flow).map(|e| *e.value())
    }

    /// Drop idle entries. Returns how many were removed.
    pub fn purge(&self, now: Instant) -> usize {
        let before = self.flows.len();
        self.flows.retain(|flow, entry| {
            now.saturating_duration_since(entry.last_seen) <= self.timeouts.for_protocol(flow.protocol)
        });
        before.saturating_sub(self.flows.len())
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

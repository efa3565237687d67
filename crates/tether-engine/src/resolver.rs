//! Where to send handshakes for a virtual address we have never talked to.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddr};

use parking_lot::RwLock;

/// Source of candidate real addresses for a virtual address.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, vpn_ip: Ipv4Addr) -> Vec<SocketAddr>;
}

/// Addresses from the `static_host_map` config section. Entries can be
/// replaced at runtime.
#[derive(Default)]
pub struct StaticHostMap {
    entries: RwLock<HashMap<Ipv4Addr, Vec<SocketAddr>>>,
}

impl StaticHostMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(map: &BTreeMap<String, Vec<String>>) -> Result<Self, StaticMapError> {
        let mut entries = HashMap::with_capacity(map.len());
        for (vpn, addrs) in map {
            let vpn_ip: Ipv4Addr = vpn
                .parse()
                .map_err(|_| StaticMapError::VpnIp(vpn.clone()))?;
            let addrs = addrs
                .iter()
                .map(|a| {
                    a.parse::<SocketAddr>()
                        .map_err(|_| StaticMapError::Addr(a.clone()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            entries.insert(vpn_ip, addrs);
        }
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    pub fn set(&self, vpn_ip: Ipv4Addr, addrs: Vec<SocketAddr>) {
        self.entries.write().insert(vpn_ip, addrs);
    }
}

impl AddressResolver for StaticHostMap {
    fn resolve(&self, vpn_ip: Ipv4Addr) -> Vec<SocketAddr> {
        self.entries.read().get(&vpn_ip).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StaticMapError {
    #[error("static_host_map key {0:?} is not an IPv4 address")]
    VpnIp(String),

    #[error("static_host_map entry {0:?} is not an ip:port")]
    Addr(String),
}

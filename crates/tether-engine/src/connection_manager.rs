//! Liveness policy for established tunnels.
//!
//! Runs on its own timer. Hosts that have gone quiet get one keepalive
//! probe; hosts that stay quiet through the pending-deletion interval are
//! removed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::hostmap::{HostMap, SweepReport};

pub struct ConnectionManager {
    hostmap: Arc<HostMap>,
    alive_interval: Duration,
    pending_deletion_interval: Duration,
}

impl ConnectionManager {
    pub fn new(
        hostmap: Arc<HostMap>,
        alive_interval: Duration,
        pending_deletion_interval: Duration,
    ) -> Self {
        Self {
            hostmap,
            alive_interval,
            pending_deletion_interval,
        }
    }

    pub fn sweep(&self, now: Instant) -> SweepReport {
        let report =
            self.hostmap
                .sweep_stale(now, self.alive_interval, self.pending_deletion_interval);

        for host in &report.probe {
            tracing::debug!(vpn_ip = %host.vpn_ip, "tunnel quiet, probing");
        }
        for host in &report.removed {
            if host.is_established() {
                tracing::info!(
                    vpn_ip = %host.vpn_ip,
                    local_index = host.local_index,
                    "tunnel removed after silence"
                );
            } else {
                tracing::debug!(vpn_ip = %host.vpn_ip, "expired handshake removed");
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostmap::HostInfo;
    use std::net::Ipv4Addr;

    #[test]
    fn sweep_applies_configured_intervals() {
        let hostmap = Arc::new(HostMap::new());
        let t0 = Instant::now();
        let host = Arc::new(HostInfo::new(
            Ipv4Addr::new(10, 0, 0, 2),
            hostmap.allocate_index(),
            t0,
        ));
        hostmap.add_established(&host).unwrap();

        let manager =
            ConnectionManager::new(hostmap.clone(), Duration::from_secs(5), Duration::from_secs(10));

        assert!(manager.sweep(t0 + Duration::from_secs(5)).probe.is_empty());
        assert_eq!(manager.sweep(t0 + Duration::from_secs(6)).probe.len(), 1);
        assert!(manager.sweep(t0 + Duration::from_secs(15)).removed.is_empty());
        assert_eq!(manager.sweep(t0 + Duration::from_secs(16)).removed.len(), 1);
        assert!(hostmap.is_empty());
    }
}

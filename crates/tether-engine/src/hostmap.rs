//! The registry of peers.
//!
//! Two tables live behind one `RwLock`:
//!
//! - **main**: established hosts, reachable by virtual address, by our local
//!   index, and (best effort) by the peer's index.
//! - **pending**: hosts with an outbound handshake in flight, reachable by
//!   virtual address and local index.
//!
//! Every insert and removal touches all views of a table under the single
//! write lock, so no reader can observe a host in one view but not another.
//! Local indexes are unique across both tables.
//!
//! A host replaced by a rekey is kept as **retired**, reachable by its local
//! index only, so datagrams the peer sent on the old session before it
//! switched are still accepted. It goes away once that session has been
//! quiet for the alive interval, or with the host that replaced it.
//!
//! The remote-index view is never used for delivery. Peers choose those
//! indexes independently, so two peers can pick the same one; the newest
//! host takes the slot and removal only clears a slot it still owns.
//!
//! Lock order: table lock, then a host's state lock. Never call into the
//! map while holding a host lock.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tether_core::{CryptoSession, PeerIdentity};

use crate::handshake::HandshakeAttempt;

/// How many lost-tie-break initiator indexes a host remembers.
const MAX_IGNORED_INITIATORS: usize = 8;

// ── HostInfo ──────────────────────────────────────────────────────────────────

/// One peer. Identity fields are fixed at creation; everything that changes
/// with traffic sits behind the state lock.
pub struct HostInfo {
    pub vpn_ip: Ipv4Addr,
    pub local_index: u32,
    pub created_at: Instant,
    state: Mutex<HostState>,
}

pub struct HostState {
    pub(crate) remote: Option<SocketAddr>,
    /// The peer's local index. Zero until learned.
    pub(crate) remote_index: u32,
    pub(crate) identity: Option<PeerIdentity>,
    pub(crate) session: Option<Arc<CryptoSession>>,
    /// Outbound attempt, present while the host is pending.
    pub(crate) handshake: Option<HandshakeAttempt>,
    pub(crate) last_seen: Instant,
    pub(crate) probe_sent_at: Option<Instant>,
    /// Responder side: the message 2 we sent, keyed by the message 1 that
    /// produced it.
    pub(crate) cached_response: Option<CachedResponse>,
    /// Newest packet waiting for the session.
    pub(crate) pending_packet: Option<Vec<u8>>,
    /// Initiator indexes whose message 1 we dropped in a tie-break.
    pub(crate) ignored_initiators: Vec<u32>,
    /// Timestamp carried by the peer's handshake that built this session.
    /// A message 1 not newer than this is a replay.
    pub(crate) peer_time: u64,
}

pub(crate) struct CachedResponse {
    pub(crate) msg1_hash: [u8; 32],
    pub(crate) msg2: Bytes,
}

impl HostInfo {
    pub fn new(vpn_ip: Ipv4Addr, local_index: u32, now: Instant) -> Self {
        Self {
            vpn_ip,
            local_index,
            created_at: now,
            state: Mutex::new(HostState {
                remote: None,
                remote_index: 0,
                identity: None,
                session: None,
                handshake: None,
                last_seen: now,
                probe_sent_at: None,
                cached_response: None,
                pending_packet: None,
                ignored_initiators: Vec::new(),
                peer_time: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.state.lock().remote
    }

    pub fn remote_index(&self) -> u32 {
        self.state.lock().remote_index
    }

    pub fn session(&self) -> Option<Arc<CryptoSession>> {
        self.state.lock().session.clone()
    }

    pub fn identity(&self) -> Option<PeerIdentity> {
        self.state.lock().identity.clone()
    }

    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_seen
    }

    pub fn probe_sent_at(&self) -> Option<Instant> {
        self.state.lock().probe_sent_at
    }

    pub fn is_established(&self) -> bool {
        self.state.lock().session.is_some()
    }

    pub fn has_pending_packet(&self) -> bool {
        self.state.lock().pending_packet.is_some()
    }

    /// Pending: the attempt ran out of retries. Otherwise: silent for
    /// longer than `limit`.
    fn is_stale(&self, now: Instant, limit: Duration) -> bool {
        let st = self.state.lock();
        match &st.handshake {
            Some(attempt) => attempt.expired,
            None => now.saturating_duration_since(st.last_seen) > limit,
        }
    }

    /// Record an authenticated packet. Returns the previous address when
    /// the peer has roamed.
    pub(crate) fn mark_seen(&self, from: SocketAddr, now: Instant) -> Option<SocketAddr> {
        let mut st = self.state.lock();
        st.last_seen = now;
        st.probe_sent_at = None;
        match st.remote {
            Some(prev) if prev == from => None,
            prev => {
                st.remote = Some(from);
                prev
            }
        }
    }

    pub fn snapshot(&self, now: Instant) -> HostSnapshot {
        let st = self.state.lock();
        HostSnapshot {
            vpn_ip: self.vpn_ip.to_string(),
            name: st.identity.as_ref().map(|i| i.name.clone()),
            local_index: self.local_index,
            remote_index: st.remote_index,
            remote: st.remote.map(|r| r.to_string()),
            established: st.session.is_some(),
            session_id: st
                .session
                .as_ref()
                .map(|s| hex::encode(&s.session_id()[..8])),
            messages_sent: st.session.as_ref().map_or(0, |s| s.messages_sent()),
            handshake_attempts: st.handshake.as_ref().map(|h| h.attempts),
            idle_secs: now.saturating_duration_since(st.last_seen).as_secs(),
            probing: st.probe_sent_at.is_some(),
            cert_not_after: st.identity.as_ref().map(|i| i.not_after),
            age_secs: now.saturating_duration_since(self.created_at).as_secs(),
        }
    }
}

impl HostState {
    pub(crate) fn ignore_initiator(&mut self, index: u32) {
        if self.ignored_initiators.contains(&index) {
            return;
        }
        if self.ignored_initiators.len() == MAX_IGNORED_INITIATORS {
            self.ignored_initiators.remove(0);
        }
        self.ignored_initiators.push(index);
    }
}

impl std::fmt::Debug for HostInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostInfo")
            .field("vpn_ip", &self.vpn_ip)
            .field("local_index", &self.local_index)
            .finish_non_exhaustive()
    }
}

/// Serializable view of one host, for the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub vpn_ip: String,
    pub name: Option<String>,
    pub local_index: u32,
    pub remote_index: u32,
    pub remote: Option<String>,
    pub established: bool,
    /// First 8 bytes of the session id, hex.
    pub session_id: Option<String>,
    pub messages_sent: u64,
    pub handshake_attempts: Option<u32>,
    pub idle_secs: u64,
    pub probing: bool,
    pub cert_not_after: Option<u64>,
    pub age_secs: u64,
}

// ── HostMap ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Tables {
    hosts: HashMap<Ipv4Addr, Arc<HostInfo>>,
    indexes: HashMap<u32, Arc<HostInfo>>,
    remote_indexes: HashMap<u32, Arc<HostInfo>>,
    pending_hosts: HashMap<Ipv4Addr, Arc<HostInfo>>,
    pending_indexes: HashMap<u32, Arc<HostInfo>>,
    /// Sessions replaced by a rekey, by local index. At most one per address.
    retired: HashMap<u32, Arc<HostInfo>>,
}

impl Tables {
    fn index_in_use(&self, index: u32) -> bool {
        index == 0
            || self.indexes.contains_key(&index)
            || self.pending_indexes.contains_key(&index)
            || self.retired.contains_key(&index)
    }

    /// Take `old` out of the main table but keep its index reachable.
    fn retire(&mut self, old: &Arc<HostInfo>) {
        if self.unlink_main(old) {
            self.forget_retired(old.vpn_ip);
            self.retired.insert(old.local_index, old.clone());
        }
    }

    fn forget_retired(&mut self, vpn_ip: Ipv4Addr) {
        self.retired.retain(|_, h| h.vpn_ip != vpn_ip);
    }

    fn insert_main(&mut self, host: &Arc<HostInfo>) {
        self.hosts.insert(host.vpn_ip, host.clone());
        self.indexes.insert(host.local_index, host.clone());
        let remote_index = host.lock().remote_index;
        if remote_index != 0 {
            self.remote_indexes.insert(remote_index, host.clone());
        }
    }

    fn unlink_main(&mut self, host: &Arc<HostInfo>) -> bool {
        match self.hosts.get(&host.vpn_ip) {
            Some(h) if Arc::ptr_eq(h, host) => {}
            _ => return false,
        }
        self.hosts.remove(&host.vpn_ip);
        self.indexes.remove(&host.local_index);

        let remote_index = host.lock().remote_index;
        if self
            .remote_indexes
            .get(&remote_index)
            .is_some_and(|h| Arc::ptr_eq(h, host))
        {
            self.remote_indexes.remove(&remote_index);
        }
        true
    }

    fn unlink_pending(&mut self, host: &Arc<HostInfo>) -> bool {
        match self.pending_indexes.get(&host.local_index) {
            Some(h) if Arc::ptr_eq(h, host) => {}
            _ => return false,
        }
        self.pending_indexes.remove(&host.local_index);
        if self
            .pending_hosts
            .get(&host.vpn_ip)
            .is_some_and(|h| Arc::ptr_eq(h, host))
        {
            self.pending_hosts.remove(&host.vpn_ip);
        }
        true
    }
}

/// Hosts picked by the read pass of a sweep.
#[derive(Default)]
struct Doomed {
    hosts: Vec<Arc<HostInfo>>,
    retired: Vec<Arc<HostInfo>>,
}

impl Doomed {
    fn is_empty(&self) -> bool {
        self.hosts.is_empty() && self.retired.is_empty()
    }
}

/// Result of one maintenance sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Silent longer than the alive interval; send them a probe.
    pub probe: Vec<Arc<HostInfo>>,
    /// Removed from every view.
    pub removed: Vec<Arc<HostInfo>>,
}

#[derive(Default)]
pub struct HostMap {
    tables: RwLock<Tables>,
}

impl HostMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick a random non-zero index not used by any host. Inserts re-check
    /// under the write lock.
    pub fn allocate_index(&self) -> u32 {
        let tables = self.tables.read();
        loop {
            let index: u32 = rand::random();
            if !tables.index_in_use(index) {
                return index;
            }
        }
    }

    // ── Lookups ───────────────────────────────────────────────────────────────

    /// Established host for a virtual address.
    pub fn query_vpn_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        self.tables.read().hosts.get(&vpn_ip).cloned()
    }

    pub fn query_pending_vpn_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        self.tables.read().pending_hosts.get(&vpn_ip).cloned()
    }

    /// Current entry for a virtual address: established if there is one,
    /// otherwise the handshaking one.
    pub fn lookup(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let tables = self.tables.read();
        tables
            .hosts
            .get(&vpn_ip)
            .or_else(|| tables.pending_hosts.get(&vpn_ip))
            .cloned()
    }

    /// Established host by our local index: the inbound demultiplexer.
    pub fn query_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.tables.read().indexes.get(&index).cloned()
    }

    pub fn query_pending_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.tables.read().pending_indexes.get(&index).cloned()
    }

    /// A session replaced by a rekey that may still carry the peer's
    /// in-flight traffic.
    pub fn query_retired_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.tables.read().retired.get(&index).cloned()
    }

    /// Best effort: see the module docs.
    pub fn query_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.tables.read().remote_indexes.get(&index).cloned()
    }

    pub fn hosts(&self) -> Vec<Arc<HostInfo>> {
        self.tables.read().hosts.values().cloned().collect()
    }

    pub fn pending_hosts(&self) -> Vec<Arc<HostInfo>> {
        self.tables.read().pending_hosts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().hosts.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.tables.read().pending_hosts.len()
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    /// Register an outbound handshake. Fails with `PendingExists` if one is
    /// already in flight for the address.
    pub fn add_pending(&self, host: &Arc<HostInfo>) -> Result<(), HostMapError> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.pending_hosts.get(&host.vpn_ip) {
            return Err(HostMapError::PendingExists(existing.clone()));
        }
        if tables.index_in_use(host.local_index) {
            return Err(HostMapError::IndexCollision(host.local_index));
        }
        tables.pending_hosts.insert(host.vpn_ip, host.clone());
        tables.pending_indexes.insert(host.local_index, host.clone());
        Ok(())
    }

    /// Move a completed pending host into the main table, replacing any
    /// established host for the same address. Returns the replaced host.
    pub fn promote(&self, host: &Arc<HostInfo>) -> Result<Option<Arc<HostInfo>>, HostMapError> {
        let mut tables = self.tables.write();
        if !tables.unlink_pending(host) {
            return Err(HostMapError::NotPending(host.vpn_ip));
        }
        let replaced = tables.hosts.get(&host.vpn_ip).cloned();
        if let Some(old) = &replaced {
            tables.retire(old);
        }
        tables.insert_main(host);
        Ok(replaced)
    }

    /// Insert a host established as responder, replacing any established
    /// host for the same address. Returns the replaced host.
    pub fn add_established(
        &self,
        host: &Arc<HostInfo>,
    ) -> Result<Option<Arc<HostInfo>>, HostMapError> {
        let mut tables = self.tables.write();
        if tables.index_in_use(host.local_index) {
            return Err(HostMapError::IndexCollision(host.local_index));
        }
        let replaced = tables.hosts.get(&host.vpn_ip).cloned();
        if let Some(old) = &replaced {
            tables.retire(old);
        }
        tables.insert_main(host);
        Ok(replaced)
    }

    /// Remove this exact host from whichever table holds it. Removing an
    /// established host also drops the session it replaced.
    pub fn remove_host(&self, host: &Arc<HostInfo>) -> bool {
        let mut tables = self.tables.write();
        if tables.unlink_main(host) {
            tables.forget_retired(host.vpn_ip);
            return true;
        }
        tables.unlink_pending(host)
    }

    /// Remove everything known for a virtual address: the established host
    /// and any handshake in flight.
    pub fn remove_vpn_ip(&self, vpn_ip: Ipv4Addr) -> Vec<Arc<HostInfo>> {
        let mut tables = self.tables.write();
        let mut removed = Vec::new();
        tables.forget_retired(vpn_ip);
        if let Some(host) = tables.hosts.get(&vpn_ip).cloned() {
            tables.unlink_main(&host);
            removed.push(host);
        }
        if let Some(host) = tables.pending_hosts.get(&vpn_ip).cloned() {
            tables.unlink_pending(&host);
            removed.push(host);
        }
        removed
    }

    // ── Maintenance ───────────────────────────────────────────────────────────

    /// Two-phase staleness sweep.
    ///
    /// An established host silent for longer than `alive` is reported for
    /// probing (once per silence). One silent for longer than
    /// `alive + pending_deletion` is removed. Pending hosts whose attempt
    /// has expired are removed, and so are retired sessions quiet for
    /// longer than `alive`.
    pub fn sweep_stale(
        &self,
        now: Instant,
        alive: Duration,
        pending_deletion: Duration,
    ) -> SweepReport {
        let deadline = alive + pending_deletion;
        let (mut report, doomed) = self.find_stale(now, alive, deadline);
        if !doomed.is_empty() {
            report.removed = self.remove_stale(doomed, now, alive, deadline);
        }
        report
    }

    /// Read pass: mark probes and pick removal candidates.
    fn find_stale(&self, now: Instant, alive: Duration, deadline: Duration) -> (SweepReport, Doomed) {
        let mut report = SweepReport::default();
        let mut doomed = Doomed::default();
        let tables = self.tables.read();

        for host in tables.hosts.values() {
            let mut st = host.lock();
            let silence = now.saturating_duration_since(st.last_seen);
            if silence > deadline {
                doomed.hosts.push(host.clone());
            } else if silence > alive && st.probe_sent_at.is_none() {
                st.probe_sent_at = Some(now);
                report.probe.push(host.clone());
            }
        }
        for host in tables.pending_hosts.values() {
            if host.is_stale(now, deadline) {
                doomed.hosts.push(host.clone());
            }
        }
        for host in tables.retired.values() {
            if host.is_stale(now, alive) {
                doomed.retired.push(host.clone());
            }
        }
        (report, doomed)
    }

    /// Write pass. Candidates are checked again: a packet may have been
    /// authenticated since the read pass let go of the lock.
    fn remove_stale(
        &self,
        doomed: Doomed,
        now: Instant,
        alive: Duration,
        deadline: Duration,
    ) -> Vec<Arc<HostInfo>> {
        let mut tables = self.tables.write();
        let mut removed = Vec::new();
        for host in doomed.hosts {
            if !host.is_stale(now, deadline) {
                continue;
            }
            if tables.unlink_main(&host) {
                tables.forget_retired(host.vpn_ip);
                removed.push(host);
            } else if tables.unlink_pending(&host) {
                removed.push(host);
            }
        }
        for host in doomed.retired {
            let owned = tables
                .retired
                .get(&host.local_index)
                .is_some_and(|h| Arc::ptr_eq(h, &host));
            if owned && host.is_stale(now, alive) {
                tables.retired.remove(&host.local_index);
            }
        }
        removed
    }

    /// Established hosts, ordered by address.
    pub fn snapshot(&self, now: Instant) -> Vec<HostSnapshot> {
        let mut hosts = self.hosts();
        hosts.sort_by_key(|h| h.vpn_ip);
        hosts.iter().map(|h| h.snapshot(now)).collect()
    }

    pub fn pending_snapshot(&self, now: Instant) -> Vec<HostSnapshot> {
        let mut hosts = self.pending_hosts();
        hosts.sort_by_key(|h| h.vpn_ip);
        hosts.iter().map(|h| h.snapshot(now)).collect()
    }

    /// Check that every view agrees with every other. Diagnostic only.
    pub fn views_consistent(&self) -> bool {
        let t = self.tables.read();

        let main_ok = t.hosts.len() == t.indexes.len()
            && t.hosts.iter().all(|(vpn, h)| {
                h.vpn_ip == *vpn
                    && t.indexes
                        .get(&h.local_index)
                        .is_some_and(|i| Arc::ptr_eq(i, h))
            });
        let pending_ok = t.pending_hosts.len() == t.pending_indexes.len()
            && t.pending_hosts.iter().all(|(vpn, h)| {
                h.vpn_ip == *vpn
                    && t.pending_indexes
                        .get(&h.local_index)
                        .is_some_and(|i| Arc::ptr_eq(i, h))
            });
        let disjoint = t.indexes.keys().all(|i| !t.pending_indexes.contains_key(i))
            && t.retired
                .keys()
                .all(|i| !t.indexes.contains_key(i) && !t.pending_indexes.contains_key(i));
        // A retired session always has a successor in the main table.
        let retired_ok = t.retired.iter().all(|(index, h)| {
            h.local_index == *index && t.hosts.get(&h.vpn_ip).is_some_and(|m| !Arc::ptr_eq(m, h))
        });
        let remote_ok = t.remote_indexes.iter().all(|(index, h)| {
            t.hosts.get(&h.vpn_ip).is_some_and(|m| Arc::ptr_eq(m, h)) && h.lock().remote_index == *index
        });

        main_ok && pending_ok && disjoint && remote_ok && retired_ok
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostMapError {
    #[error("handshake already pending for {}", .0.vpn_ip)]
    PendingExists(Arc<HostInfo>),

    #[error("local index {0} already in use")]
    IndexCollision(u32),

    #[error("host {0} is no longer pending")]
    NotPending(Ipv4Addr),

    #[error("no host for {0}")]
    NotFound(Ipv4Addr),
}

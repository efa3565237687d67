use std::time::Duration;

use tether_core::crypto::REKEY_AFTER_MESSAGES;
use tether_core::wire::subtype;

use crate::*;

#[test]
fn quiet_tunnel_is_probed_and_kept_alive() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);

    net.advance(Duration::from_secs(6));
    net.maintenance_tick();
    assert!(net.nodes[0].host(B_VPN).unwrap().probe_sent_at().is_some());
    net.route();

    for (node, peer) in [(0, B_VPN), (1, A_VPN)] {
        let host = net.nodes[node].host(peer).expect("tunnel kept");
        assert!(host.probe_sent_at().is_none());
        assert_eq!(host.last_seen(), net.now);
    }
    // Probes are not traffic.
    assert_eq!(net.nodes[0].delivered.len(), 0);
    assert_eq!(net.nodes[1].delivered.len(), 1);
}

#[test]
fn silent_peer_is_removed_after_pending_deletion() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.unreachable.insert(1);

    net.advance(Duration::from_secs(6));
    net.maintenance_tick();
    net.route();
    assert!(net.nodes[0].host(B_VPN).unwrap().probe_sent_at().is_some());

    net.advance(Duration::from_secs(8));
    net.maintenance_tick();
    net.route();
    assert!(net.nodes[0].host(B_VPN).is_some(), "still within grace period");

    net.advance(Duration::from_secs(2));
    net.maintenance_tick();
    let hostmap = net.nodes[0].interface.hostmap();
    assert!(hostmap.is_empty());
    assert!(hostmap.views_consistent());
}

#[test]
fn roaming_peer_updates_remote() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);

    let roamed: SocketAddr = "192.168.1.2:50000".parse().unwrap();
    net.rebind(1, roamed);

    let reply = udp_packet(B_VPN, A_VPN, 90, 80, b"from new address");
    net.send_inside(1, &reply).unwrap();
    net.route();
    assert_eq!(net.nodes[0].delivered, vec![reply]);
    assert_eq!(net.nodes[0].host(B_VPN).unwrap().remote(), Some(roamed));

    net.nodes[1].delivered.clear();
    let follow_up = udp_packet(A_VPN, B_VPN, 80, 90, b"found you");
    net.send_inside(0, &follow_up).unwrap();
    assert_eq!(net.queue.front().unwrap().dst, roamed);
    net.route();
    assert_eq!(net.nodes[1].delivered, vec![follow_up]);
}

#[test]
fn close_tunnel_tears_down_both_sides() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);

    let mut out = Outbox::new();
    net.nodes[0].interface.close_tunnel(B_VPN, &mut out).unwrap();
    assert_eq!(out.transmits.len(), 1);
    let close = Wire {
        from: net.nodes[0].addr,
        dst: out.transmits[0].dst,
        payload: out.transmits[0].payload.to_vec(),
    };
    assert_eq!(close.header().message_type, MessageType::CloseTunnel);
    net.inject(close);

    for node in &net.nodes {
        assert!(node.interface.hostmap().is_empty());
        assert!(node.interface.hostmap().views_consistent());
    }

    // Closing again is an error, not a panic.
    let mut out = Outbox::new();
    assert!(net.nodes[0].interface.close_tunnel(B_VPN, &mut out).is_err());
    assert!(out.is_empty());

    // Traffic brings the tunnel back.
    net.establish(0, 1);
}

#[test]
fn counter_exhaustion_forces_new_session() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[1].delivered.clear();

    let old = net.nodes[0].session(B_VPN);
    let old_id = *old.session_id();
    old.set_send_counter(u64::MAX);

    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"after exhaustion");
    let result = net.send_inside(0, &packet);
    assert!(matches!(result, Err(EngineError::ResourceExhausted)));
    assert!(net.nodes[0].host(B_VPN).is_none());
    assert_eq!(net.nodes[0].interface.hostmap().pending_len(), 1);
    net.route();

    let fresh = net.nodes[0].session(B_VPN);
    assert_ne!(*fresh.session_id(), old_id);
    assert_eq!(*net.nodes[1].session(A_VPN).session_id(), *fresh.session_id());

    net.send_inside(0, &packet).unwrap();
    net.route();
    assert_eq!(net.nodes[1].delivered, vec![packet]);
}

/// Crossing the rekey threshold renegotiates while the old session keeps
/// carrying traffic.
#[test]
fn rekey_threshold_renegotiates_without_loss() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[1].delivered.clear();

    let old = net.nodes[0].session(B_VPN);
    let old_id = *old.session_id();
    old.set_send_counter(REKEY_AFTER_MESSAGES);

    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"near the limit");
    net.send_inside(0, &packet).unwrap();
    assert!(net.nodes[0].host(B_VPN).is_some(), "old session stays up");
    assert_eq!(net.nodes[0].interface.hostmap().pending_len(), 1);
    net.route();

    assert_eq!(net.nodes[1].delivered, vec![packet]);
    let fresh = net.nodes[0].session(B_VPN);
    assert_ne!(*fresh.session_id(), old_id);
    assert_eq!(*net.nodes[1].session(A_VPN).session_id(), *fresh.session_id());
    for node in &net.nodes {
        assert_eq!(node.interface.hostmap().len(), 1);
        assert_eq!(node.interface.hostmap().pending_len(), 0);
        assert!(node.interface.hostmap().views_consistent());
    }
}

/// Data the initiator sends on the old session after the responder has
/// already switched is still delivered, until the old session goes quiet.
#[test]
fn old_session_carries_traffic_while_rekey_completes() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[1].delivered.clear();

    let old = net.nodes[0].session(B_VPN);
    let old_id = *old.session_id();
    let b_old_index = net.nodes[1].host(A_VPN).unwrap().local_index;
    old.set_send_counter(REKEY_AFTER_MESSAGES);

    let first = udp_packet(A_VPN, B_VPN, 80, 90, b"before msg1");
    net.send_inside(0, &first).unwrap();
    assert_eq!(net.queue.len(), 2, "data, then the rekey msg1");
    net.step();
    net.step();

    // B answered and switched; A has not seen message 2 yet.
    assert!(net.queue[0].is_handshake(2));
    assert_ne!(*net.nodes[1].session(A_VPN).session_id(), old_id);
    assert_eq!(*net.nodes[0].session(B_VPN).session_id(), old_id);

    let second = udp_packet(A_VPN, B_VPN, 80, 90, b"before msg2");
    net.send_inside(0, &second).unwrap();
    net.route();

    assert_eq!(net.nodes[1].delivered, vec![first, second]);
    assert!(net.nodes[1].errors.is_empty());
    assert_eq!(
        *net.nodes[0].session(B_VPN).session_id(),
        *net.nodes[1].session(A_VPN).session_id()
    );
    for node in &net.nodes {
        assert_eq!(node.interface.hostmap().len(), 1);
        assert!(node.interface.hostmap().views_consistent());
    }

    // Once quiet for the alive interval, the old index is forgotten.
    net.advance(Duration::from_secs(6));
    net.maintenance_tick();
    net.queue.clear();
    let late = old
        .encrypt(
            MessageType::Message,
            subtype::NONE,
            b_old_index,
            &udp_packet(A_VPN, B_VPN, 80, 90, b"too late"),
        )
        .unwrap();
    net.inject(Wire {
        from: net.nodes[0].addr,
        dst: net.nodes[1].addr,
        payload: late,
    });
    assert!(matches!(
        net.nodes[1].errors.last(),
        Some(EngineError::UnknownIndex(i)) if *i == b_old_index
    ));
}

#[test]
fn status_reflects_host_map() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);

    let status = net.nodes[0].interface.status();
    assert_eq!(status.name, "node-1");
    assert_eq!(status.vpn_ip, "10.0.0.1");
    assert_eq!(status.hosts, 1);
    assert_eq!(status.pending, 0);
    assert_eq!(status.tracked_flows, 1);

    let snapshot = net.nodes[0].interface.hostmap().snapshot(net.now);
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].established);
    assert_eq!(snapshot[0].name.as_deref(), Some("node-2"));
}

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tether_core::crypto::REKEY_AFTER_MESSAGES;
use tether_engine::handshake::HandshakeError;
use tether_engine::EngineError;

use crate::*;

/// Both sides agree on each other's index and on the session.
#[test]
fn handshake_establishes_symmetric_indexes() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);

    let a_side = net.nodes[0].host(B_VPN).unwrap();
    let b_side = net.nodes[1].host(A_VPN).unwrap();
    assert_eq!(a_side.remote_index(), b_side.local_index);
    assert_eq!(b_side.remote_index(), a_side.local_index);
    assert_eq!(
        a_side.session().unwrap().session_id(),
        b_side.session().unwrap().session_id()
    );
    assert_eq!(a_side.identity().unwrap().name, "node-2");
    assert_eq!(b_side.identity().unwrap().name, "node-1");

    for node in &net.nodes {
        let hostmap = node.interface.hostmap();
        assert!(hostmap.views_consistent());
        assert_eq!(hostmap.len(), 1);
        assert_eq!(hostmap.pending_len(), 0);
    }
}

/// Both nodes start at once. The lower address yields, and exactly one
/// session exists afterwards.
#[test]
fn simultaneous_start_converges() {
    let mut net = Net::two_nodes();
    let from_a = udp_packet(A_VPN, B_VPN, 80, 90, b"from a");
    let from_b = udp_packet(B_VPN, A_VPN, 90, 80, b"from b");
    net.send_inside(0, &from_a).unwrap();
    net.send_inside(1, &from_b).unwrap();
    let a_msg1 = net
        .queue
        .iter()
        .find(|w| w.from == net.nodes[0].addr)
        .cloned()
        .unwrap();
    net.route();

    let a_side = net.nodes[0].host(B_VPN).unwrap();
    let b_side = net.nodes[1].host(A_VPN).unwrap();
    assert_eq!(a_side.remote_index(), b_side.local_index);
    assert_eq!(b_side.remote_index(), a_side.local_index);
    assert_eq!(
        a_side.session().unwrap().session_id(),
        b_side.session().unwrap().session_id()
    );
    for node in &net.nodes {
        assert_eq!(node.interface.hostmap().len(), 1);
        assert_eq!(node.interface.hostmap().pending_len(), 0);
        assert!(node.interface.hostmap().views_consistent());
    }

    // Both buffered packets survived the tie-break.
    assert_eq!(net.nodes[1].delivered, vec![from_a]);
    assert_eq!(net.nodes[0].delivered, vec![from_b]);

    // A's first attempt arriving late must not replace the session.
    net.inject(a_msg1);
    let still = net.nodes[1].host(A_VPN).unwrap();
    assert!(Arc::ptr_eq(&still, &b_side));
    assert!(matches!(
        net.nodes[1].errors.last(),
        Some(EngineError::Handshake(HandshakeError::Superseded(_)))
    ));
}

/// A retransmitted message 1 gets the cached response, not a new session.
#[test]
fn replayed_msg1_gets_cached_response() {
    let mut net = Net::two_nodes();
    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"hello");
    net.send_inside(0, &packet).unwrap();
    let msg1 = net.queue.front().cloned().unwrap();
    assert!(msg1.is_handshake(1));
    net.route();

    let b_side = net.nodes[1].host(A_VPN).unwrap();
    let session_id = *b_side.session().unwrap().session_id();

    net.inject(msg1);
    assert_eq!(net.queue.len(), 1);
    assert!(net.queue[0].is_handshake(2));
    net.route();

    let after = net.nodes[1].host(A_VPN).unwrap();
    assert!(Arc::ptr_eq(&after, &b_side));
    assert_eq!(*after.session().unwrap().session_id(), session_id);
    assert_eq!(net.nodes[0].host(B_VPN).unwrap().remote_index(), b_side.local_index);
    assert!(matches!(
        net.nodes[0].errors.last(),
        Some(EngineError::Handshake(HandshakeError::AlreadyEstablished(_)))
    ));
}

/// A captured message 1 from an earlier handshake cannot replace the
/// session a later handshake built.
#[test]
fn stale_msg1_cannot_replace_newer_session() {
    let mut net = Net::two_nodes();
    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"hello"))
        .unwrap();
    let old_msg1 = net.queue.front().cloned().unwrap();
    assert!(old_msg1.is_handshake(1));
    net.route();

    // Rekey, so B now holds a session built from a newer message 1.
    net.nodes[0].session(B_VPN).set_send_counter(REKEY_AFTER_MESSAGES);
    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"rekey"))
        .unwrap();
    net.route();
    let b_side = net.nodes[1].host(A_VPN).unwrap();
    let session_id = *b_side.session().unwrap().session_id();
    assert_eq!(*net.nodes[0].session(B_VPN).session_id(), session_id);

    net.inject(old_msg1);
    assert!(net.queue.is_empty(), "no answer to a stale handshake");
    assert!(matches!(
        net.nodes[1].errors.last(),
        Some(EngineError::Handshake(HandshakeError::Replayed(_)))
    ));
    let after = net.nodes[1].host(A_VPN).unwrap();
    assert!(Arc::ptr_eq(&after, &b_side));
    assert_eq!(*after.session().unwrap().session_id(), session_id);

    net.nodes[1].delivered.clear();
    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"still flowing");
    net.send_inside(0, &packet).unwrap();
    net.route();
    assert_eq!(net.nodes[1].delivered, vec![packet]);
}

#[test]
fn handshake_retransmits_through_loss() {
    let mut net = Net::two_nodes();
    net.unreachable.insert(1);

    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"eventually");
    net.send_inside(0, &packet).unwrap();
    net.route();
    assert_eq!(net.nodes[0].interface.hostmap().pending_len(), 1);

    net.unreachable.clear();
    net.advance(Duration::from_millis(100));
    assert_eq!(net.handshake_tick(), 0);
    net.route();

    assert!(net.nodes[0].host(B_VPN).is_some());
    assert_eq!(net.nodes[1].delivered, vec![packet]);
}

#[test]
fn handshake_expires_after_retries() {
    let mut net = Net::two_nodes();
    net.unreachable.insert(1);

    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"lost"))
        .unwrap();

    let mut expired = 0;
    for _ in 0..10 {
        net.advance(Duration::from_millis(100));
        expired += net.handshake_tick();
        net.route();
    }
    assert_eq!(expired, 1);
    assert_eq!(net.nodes[0].interface.hostmap().pending_len(), 0);
    assert!(net.nodes[0].interface.hostmap().is_empty());
}

/// Packets queued during a handshake collapse onto one attempt.
#[test]
fn second_packet_during_handshake_joins_attempt() {
    let mut net = Net::two_nodes();
    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"first"))
        .unwrap();
    let second = udp_packet(A_VPN, B_VPN, 80, 90, b"second");
    net.send_inside(0, &second).unwrap();

    assert_eq!(net.queue.len(), 1);
    assert_eq!(net.nodes[0].interface.hostmap().pending_len(), 1);

    net.route();
    assert_eq!(net.nodes[1].delivered, vec![second]);
}

#[test]
fn expired_certificate_is_rejected() {
    let loaded_at = UNIX_EPOCH + Duration::from_secs(1_500);
    let mut net = NetBuilder::new()
        .node(A_VPN)
        .node_with_validity(C_VPN, 1_000, 2_000, loaded_at)
        .build();
    assert!(SystemTime::now() > loaded_at);

    net.send_inside(1, &udp_packet(C_VPN, A_VPN, 80, 90, b"stale"))
        .unwrap();
    net.route();

    assert!(net.nodes[0].interface.hostmap().is_empty());
    assert!(net.nodes[0].delivered.is_empty());
    assert!(matches!(
        net.nodes[0].errors.as_slice(),
        [EngineError::Handshake(HandshakeError::Expired(_))]
    ));
}

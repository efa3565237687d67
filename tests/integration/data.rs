use tether_core::config::RuleConfig;
use tether_engine::firewall::Direction;

use crate::*;

#[test]
fn hello_and_reply_cross_tunnel() {
    let a_vpn = Ipv4Addr::new(10, 0, 0, 129);
    let mut net = NetBuilder::new().node(a_vpn).node(B_VPN).build();

    net.send_inside(0, &udp_packet(a_vpn, B_VPN, 80, 90, b"Hello from A"))
        .unwrap();
    net.route();
    assert_eq!(net.nodes[1].delivered.len(), 1);
    let seen = parse_udp(&net.nodes[1].delivered[0]);
    assert_eq!(seen.src, a_vpn);
    assert_eq!(seen.dst, B_VPN);
    assert_eq!((seen.sport, seen.dport), (80, 90));
    assert_eq!(seen.payload, b"Hello from A");

    net.send_inside(1, &udp_packet(B_VPN, a_vpn, 90, 80, b"Hi from B"))
        .unwrap();
    assert_eq!(net.queue.len(), 1, "established tunnel needs no handshake");
    net.route();
    assert_eq!(net.nodes[0].delivered.len(), 1);
    let seen = parse_udp(&net.nodes[0].delivered[0]);
    assert_eq!(seen.src, B_VPN);
    assert_eq!(seen.dst, a_vpn);
    assert_eq!((seen.sport, seen.dport), (90, 80));
    assert_eq!(seen.payload, b"Hi from B");

    assert!(net.nodes.iter().all(|n| n.errors.is_empty()));
}

#[test]
fn replayed_data_is_dropped() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[1].delivered.clear();

    let packet = udp_packet(A_VPN, B_VPN, 80, 90, b"once");
    net.send_inside(0, &packet).unwrap();
    let captured = net.queue.front().cloned().unwrap();
    net.route();
    assert_eq!(net.nodes[1].delivered.len(), 1);

    net.inject(captured);
    assert_eq!(net.nodes[1].delivered.len(), 1);
    assert!(matches!(
        net.nodes[1].errors.last(),
        Some(EngineError::ReplayDetected)
    ));
}

#[test]
fn tampered_data_is_dropped() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[1].delivered.clear();

    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"intact"))
        .unwrap();
    let mut wire = net.queue.pop_front().unwrap();
    let last = wire.payload.len() - 1;
    wire.payload[last] ^= 0x01;
    net.inject(wire);

    assert!(net.nodes[1].delivered.is_empty());
    assert!(matches!(
        net.nodes[1].errors.last(),
        Some(EngineError::AuthFailed)
    ));
    // The session survives a forged packet.
    net.send_inside(0, &udp_packet(A_VPN, B_VPN, 80, 90, b"next"))
        .unwrap();
    net.route();
    assert_eq!(net.nodes[1].delivered.len(), 1);
}

/// A only allows outbound traffic. Replies to its flows get in, unsolicited
/// packets do not.
#[test]
fn outbound_only_firewall_admits_replies() {
    let mut net = NetBuilder::new()
        .config(|c| c.firewall.inbound = Vec::new())
        .node(A_VPN)
        .config(|c| c.firewall.inbound = vec![RuleConfig::any()])
        .node(B_VPN)
        .build();
    net.establish(0, 1);

    let unsolicited = udp_packet(B_VPN, A_VPN, 5000, 22, b"knock");
    net.send_inside(1, &unsolicited).unwrap();
    net.route();
    assert!(net.nodes[0].delivered.is_empty());
    assert!(matches!(
        net.nodes[0].errors.last(),
        Some(EngineError::FirewallDenied(Direction::Inbound))
    ));

    let reply = udp_packet(B_VPN, A_VPN, 90, 80, b"reply");
    net.send_inside(1, &reply).unwrap();
    net.route();
    assert_eq!(net.nodes[0].delivered, vec![reply]);
}

#[test]
fn outbound_rules_are_enforced_before_encryption() {
    let mut net = NetBuilder::new()
        .config(|c| {
            c.firewall.outbound = vec![RuleConfig {
                proto: "udp".to_string(),
                ..RuleConfig::any()
            }]
        })
        .node(A_VPN)
        .node(B_VPN)
        .build();
    net.establish(0, 1);

    let denied = net.send_inside(0, &tcp_packet(A_VPN, B_VPN, 40000, 443));
    assert!(matches!(
        denied,
        Err(EngineError::FirewallDenied(Direction::Outbound))
    ));
    assert!(net.queue.is_empty());
}

/// A peer can only speak for its own overlay address.
#[test]
fn spoofed_inner_source_is_dropped() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    net.nodes[0].delivered.clear();

    let forged = udp_packet(C_VPN, A_VPN, 90, 80, b"not really c");
    net.send_inside(1, &forged).unwrap();
    net.route();

    assert!(net.nodes[0].delivered.is_empty());
    assert!(matches!(
        net.nodes[0].errors.last(),
        Some(EngineError::Spoofed { claimed, peer }) if *claimed == C_VPN && *peer == B_VPN
    ));
}

#[test]
fn packets_outside_overlay_are_refused() {
    let mut net = Net::two_nodes();

    let outside = udp_packet(A_VPN, Ipv4Addr::new(172, 16, 0, 1), 80, 90, b"x");
    assert!(matches!(
        net.send_inside(0, &outside),
        Err(EngineError::NotInNetwork(_))
    ));
    let to_self = udp_packet(A_VPN, A_VPN, 80, 90, b"x");
    assert!(matches!(
        net.send_inside(0, &to_self),
        Err(EngineError::ToSelf)
    ));
    assert!(matches!(
        net.send_inside(0, b"\x60not ipv4"),
        Err(EngineError::Malformed(_))
    ));
    assert!(net.queue.is_empty());
}

/// Garbage from the underlay is dropped without touching the host map.
#[test]
fn malformed_datagrams_are_ignored() {
    let mut net = Net::two_nodes();
    net.establish(0, 1);
    let a_addr = net.nodes[0].addr;
    let b_addr = net.nodes[1].addr;

    for payload in [vec![], vec![0xff; 8], vec![0x10; 64]] {
        net.inject(Wire {
            from: a_addr,
            dst: b_addr,
            payload,
        });
    }
    assert_eq!(net.nodes[1].errors.len(), 3);
    assert_eq!(net.nodes[1].interface.hostmap().len(), 1);
    assert!(net.nodes[1].interface.hostmap().views_consistent());
}

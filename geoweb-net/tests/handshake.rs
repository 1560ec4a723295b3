//! Session setup: handshake, network id checks, self-connection blocking
//! and broadcast preferences.

mod common;

use {
    assert_matches::assert_matches,
    common::*,
    geoweb_net::{
        message::fields, ControlMessage, EventHandlers, GeoWebConfig, GeoWebError, Network,
        NetworkEvent, SessionState, Tier,
    },
    parking_lot::Mutex,
    std::{net::TcpListener, sync::Arc, time::Duration},
};

#[test]
fn test_two_nodes_handshake() {
    init_logging();
    let a = spawn_node(1);
    let b = spawn_node(1);

    let (a_to_b, b_to_a) = connect(&a, &b);

    assert_eq!(a_to_b.state(), SessionState::Handshaked);
    assert!(a_to_b.is_initiator());
    assert!(!b_to_a.is_initiator());
    assert_eq!(a_to_b.address(), b.address());
    assert_eq!(b_to_a.address(), a.address());
    assert_eq!(
        a_to_b.session_id().as_deref(),
        Some(b.network.session_id())
    );
    assert_eq!(a.network.peer_addresses(), vec![b.address()]);
    assert_eq!(b.network.handshaked_count(), 1);
    assert_eq!(a.network.pending_count(), 0);

    // both sides remember each other as current candidates
    assert!(wait_until(WAIT, || a.network.candidates().tier_of(&b.address())
        == Some(Tier::Current)));
    assert!(wait_until(WAIT, || b.network.candidates().tier_of(&a.address())
        == Some(Tier::Current)));

    assert_matches!(
        a.wait_event(WAIT, |e| matches!(e, NetworkEvent::PeerHandshaked(_))),
        Some(NetworkEvent::PeerHandshaked(peer)) if peer.address() == b.address()
    );

    // second dial to a live peer is refused
    assert_matches!(
        a.network.connect_to("127.0.0.1", b.port()),
        Err(GeoWebError::AlreadyConnected(_))
    );
}

#[test]
fn test_network_id_mismatch_closes() {
    init_logging();
    let a = spawn_node(1);
    let b = spawn_node(2);

    let session = a.network.connect_to("127.0.0.1", b.port()).unwrap();
    assert!(wait_until(WAIT, || session.is_closed()));
    assert!(a
        .wait_event(WAIT, |e| matches!(e, NetworkEvent::PeerDisconnected(_)))
        .is_some());
    assert_eq!(a.network.handshaked_count(), 0);
    assert!(wait_until(WAIT, || b.network.pending_count() == 0));
    assert_eq!(b.network.handshaked_count(), 0);
}

#[test]
fn test_own_session_id_blocks_address() {
    init_logging();
    let node = spawn_node(1);
    let decoy = TcpListener::bind("127.0.0.1:0").unwrap();
    let decoy_port = decoy.local_addr().unwrap().port();

    let mut raw = RawPeer::connect(node.port());
    raw.send(&ControlMessage::handshake(
        1,
        node.network.session_id(),
        "",
        decoy_port,
        true,
    ));
    assert!(raw.is_closed_by_remote());

    let blocked = format!("127.0.0.1:{decoy_port}");
    assert!(wait_until(WAIT, || node.network.is_blocked(&blocked)));
    assert_matches!(
        node.network.connect_to("127.0.0.1", decoy_port),
        Err(GeoWebError::Blocked(_))
    );
    assert_eq!(node.network.handshaked_count(), 0);
}

#[test]
fn test_duplicate_session_id_blocks_second_connection() {
    init_logging();
    let node = spawn_node(1);

    let mut first = RawPeer::connect(node.port());
    first.handshake(1, "shared-id", 40_001);
    assert!(wait_until(WAIT, || node.network.handshaked_count() == 1));

    let mut second = RawPeer::connect(node.port());
    second.send(&ControlMessage::handshake(1, "shared-id", "", 40_002, true));
    assert!(second.is_closed_by_remote());
    assert!(wait_until(WAIT, || node.network.is_blocked("127.0.0.1:40002")));

    // the original session is untouched
    assert_eq!(node.network.handshaked_count(), 1);
    assert!(node.network.peer_by_id("shared-id").is_some());
}

#[test]
fn test_commands_ignored_before_handshake() {
    init_logging();
    // one worker keeps processing in arrival order
    let mut config = GeoWebConfig::dev_default(1);
    config.worker_pool_size = 1;
    let node = spawn_node_with(config, |builder| builder);
    let mut raw = RawPeer::connect(node.port());

    raw.send(&ControlMessage::ping().with(fields::REQ_UID, "early"));
    raw.send(&ControlMessage::new("appCommand"));
    let reply = raw.handshake(1, "raw-peer", 40_003);
    assert_eq!(reply.get_i64(fields::NET_ID), Some(1));
    assert_eq!(reply.get_str(fields::ID), Some(node.network.session_id()));

    raw.send(&ControlMessage::ping().with(fields::REQ_UID, "late"));
    let pong = raw.recv_command("pong").expect("pong after handshake");
    assert_eq!(pong.get_str(fields::RESP_UID), Some("late"));

    // the application only hears from handshaked sessions
    let (first, _) = node.messages.recv_timeout(WAIT).expect("hook sees the late ping");
    assert_eq!(first.command(), Some("ping"));
    assert_eq!(first.get_str(fields::REQ_UID), Some("late"));
    let seen: Vec<_> = node
        .messages
        .try_iter()
        .map(|(msg, _)| msg.command().unwrap_or_default().to_string())
        .collect();
    assert!(seen.is_empty(), "unexpected hook calls: {seen:?}");
}

#[test]
fn test_rejected_peer_never_reaches_application() {
    init_logging();
    let mut config = GeoWebConfig::dev_default(1);
    config.worker_pool_size = 1;
    let node = spawn_node_with(config, |builder| builder);
    let mut raw = RawPeer::connect(node.port());

    raw.send(&ControlMessage::new("appCommand"));
    raw.send(&ControlMessage::handshake(999, "foreign", "", 40_005, true));
    assert!(raw.is_closed_by_remote());
    assert!(node
        .wait_event(WAIT, |e| matches!(e, NetworkEvent::PeerDisconnected(_)))
        .is_some());

    assert!(node.wait_message("appCommand", Duration::from_millis(300)).is_none());
    assert!(node.messages.try_iter().next().is_none());
    assert_eq!(node.network.handshaked_count(), 0);
}

#[test]
fn test_advertised_hostname_and_port_override() {
    init_logging();
    let node = spawn_node(1);
    let mut raw = RawPeer::connect(node.port());
    raw.send(&ControlMessage::handshake(1, "named", "peer.example.com", 40_004, true));
    raw.recv_command("handshake").unwrap();

    assert!(wait_until(WAIT, || node.network.peer("peer.example.com:40004").is_some()));
    let session = node.network.peer_by_id("named").unwrap();
    assert_eq!(session.hostname(), "peer.example.com");
    assert_eq!(session.port(), 40_004);
}

#[test]
fn test_accept_broadcast_preference() {
    init_logging();
    let a = spawn_node(1);
    let mut config = GeoWebConfig::dev_default(1);
    config.accepts_broadcast = false;
    let b = spawn_node_with(config, |builder| builder);

    let (a_to_b, b_to_a) = connect(&a, &b);
    assert!(!a_to_b.can_broadcast());
    assert_eq!(a.network.broadcast(&ControlMessage::new("news")), 0);

    // direct sends still go through
    a_to_b.send_message(&ControlMessage::new("direct")).unwrap();
    assert!(b.wait_message("direct", WAIT).is_some());

    b_to_a
        .send_message(&ControlMessage::accept_broadcast(true))
        .unwrap();
    assert!(wait_until(WAIT, || a_to_b.can_broadcast()));
    assert_eq!(a.network.broadcast(&ControlMessage::new("news")), 1);
    assert!(b.wait_message("news", WAIT).is_some());
}

#[test]
fn test_event_handler_table() {
    init_logging();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let (s1, s2, s3) = (seen.clone(), seen.clone(), seen.clone());
        EventHandlers::new()
            .on_setup_complete(move |_| s1.lock().push("setup".to_string()))
            .on_peer_connected(move |_| s2.lock().push("connected".to_string()))
            .on_peer_handshaked(move |peer| s3.lock().push(peer.address()))
    };
    let listener = Network::builder(GeoWebConfig::dev_default(1))
        .event_handlers(handlers)
        .build()
        .unwrap();
    let dialer = spawn_node(1);
    dialer
        .network
        .connect_to("127.0.0.1", listener.port())
        .unwrap();

    let expected = dialer.address();
    assert!(wait_until(WAIT, || seen.lock().len() == 3));
    assert_eq!(
        *seen.lock(),
        vec!["setup".to_string(), "connected".to_string(), expected]
    );
    listener.shutdown();
    assert!(wait_until(WAIT, || dialer.network.peers().is_empty()));
}

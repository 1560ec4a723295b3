//! Synchronous requests, broadcast and content-addressed transfers.

mod common;

use {
    assert_matches::assert_matches,
    common::*,
    geoweb_net::{
        message::fields,
        ContentHash, ControlMessage, DataTransfer, GeoWebConfig, GeoWebError, Network,
        NetworkEvent, PeerSession, ResponseCode, TransferStatus,
    },
    std::{sync::Arc, time::Duration},
};

/// A node whose application answers `echo` with the request's `value`
/// and status 200, and ignores everything else.
fn echo_node() -> Network {
    Network::builder(GeoWebConfig::dev_default(1))
        .message_handler(|msg: &ControlMessage, peer: &Arc<PeerSession>| {
            if msg.command() == Some("echo") {
                let reply = ControlMessage::new("echoed")
                    .with(fields::VALUE, msg.get(fields::VALUE).cloned().unwrap_or_default());
                peer.respond_with_code(reply, msg, ResponseCode::Ok).unwrap();
            }
        })
        .build()
        .unwrap()
}

#[test]
fn test_sync_message_round_trip() {
    init_logging();
    let client = spawn_node(1);
    let server = echo_node();
    let session = client.network.connect_to("127.0.0.1", server.port()).unwrap();
    assert!(wait_until(WAIT, || session.is_handshaked()));

    let response = session
        .send_sync_message(ControlMessage::new("echo").with(fields::VALUE, "hello"))
        .unwrap();
    assert_eq!(response.code, ResponseCode::Ok);
    let reply = response.message.unwrap();
    assert_eq!(reply.command(), Some("echoed"));
    assert_eq!(reply.get_str(fields::VALUE), Some("hello"));
    assert!(reply.has(fields::RESP_UID));

    // nobody answers this one
    let response = session
        .send_sync_message(ControlMessage::new("silence"))
        .unwrap();
    assert_eq!(response.code, ResponseCode::RequestTimeout);
    assert!(response.message.is_none());

    assert_matches!(
        session.send_sync_message(ControlMessage::new("echo").with(fields::REQ_UID, "mine")),
        Err(GeoWebError::ReservedField(_))
    );
}

#[test]
fn test_sync_message_fails_when_peer_drops() {
    init_logging();
    let client = spawn_node(1);
    let server = spawn_node(1);
    let (to_server, _) = connect(&client, &server);

    let waiter = {
        let to_server = to_server.clone();
        std::thread::spawn(move || to_server.send_sync_message(ControlMessage::new("slow")))
    };
    assert!(server.wait_message("slow", WAIT).is_some());
    server.network.shutdown();
    assert_matches!(waiter.join().unwrap(), Err(GeoWebError::SessionClosed));
}

#[test]
fn test_broadcast_skips_excluded_peers() {
    init_logging();
    let hub = spawn_node(1);
    let left = spawn_node(1);
    let right = spawn_node(1);
    let (_, hub_to_left) = connect(&left, &hub);
    connect(&right, &hub);

    let sent = hub
        .network
        .broadcast_except(&ControlMessage::new("note"), &[hub_to_left]);
    assert_eq!(sent, 1);
    assert!(right.wait_message("note", WAIT).is_some());
    assert!(left.wait_message("note", Duration::from_millis(300)).is_none());
}

#[test]
fn test_data_transfer_between_nodes() {
    init_logging();
    let downloader = spawn_node(1);
    let provider = spawn_node(1);
    let (to_provider, _) = connect(&downloader, &provider);

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let hash = ContentHash::of(&payload);
    let transfer = Arc::new(DataTransfer::new(hash));
    to_provider.request_data(transfer.clone()).unwrap();

    let Some(NetworkEvent::DataRequested(request)) = provider.wait_event(WAIT, |e| {
        matches!(e, NetworkEvent::DataRequested(_))
    }) else {
        panic!("provider never saw the request");
    };
    assert_eq!(request.hash(), &hash);
    assert_matches!(
        request.upload(b"not the payload"),
        Err(GeoWebError::HashMismatch(_))
    );
    request.upload(&payload).unwrap();

    assert_eq!(transfer.wait(WAIT), TransferStatus::Ok);
    assert_eq!(transfer.size(), payload.len());
    assert_eq!(transfer.downloaded(), payload.len());
    assert_eq!(transfer.data().unwrap(), payload);
    assert_eq!(to_provider.pending_transfers(), 0);
}

#[test]
fn test_corrupted_transfer_fails_but_session_survives() {
    init_logging();
    let node = spawn_node(1);
    let mut raw = RawPeer::connect(node.port());
    raw.handshake(1, "provider", 40_100);
    assert!(wait_until(WAIT, || node.network.peer_by_id("provider").is_some()));
    let session = node.network.peer_by_id("provider").unwrap();

    let hash = ContentHash::of(b"the genuine bytes");
    let transfer = Arc::new(DataTransfer::new(hash));
    session.request_data(transfer.clone()).unwrap();
    let request = raw.recv_command("requestData").unwrap();
    assert_eq!(request.get_str(fields::HASH), Some(hash.to_hex().as_str()));

    raw.send_raw_data(&hash, b"tampered bytes!!!");
    assert_eq!(transfer.wait(WAIT), TransferStatus::Error);
    assert!(transfer.data().is_none());

    raw.send(&ControlMessage::ping());
    assert!(raw.recv_command("pong").is_some());
    assert!(!session.is_closed());
}

#[test]
fn test_unrequested_data_closes_session() {
    init_logging();
    let node = spawn_node(1);
    let mut raw = RawPeer::connect(node.port());
    raw.handshake(1, "pushy", 40_101);
    assert!(wait_until(WAIT, || node.network.handshaked_count() == 1));

    raw.send_raw_data(&ContentHash::of(b"spam"), b"spam");
    assert!(raw.is_closed_by_remote());
    assert!(wait_until(WAIT, || node.network.handshaked_count() == 0));
    assert!(node
        .wait_event(WAIT, |e| matches!(e, NetworkEvent::PeerDisconnected(_)))
        .is_some());
}

#[test]
fn test_pending_transfer_fails_on_disconnect() {
    init_logging();
    let node = spawn_node(1);
    let mut raw = RawPeer::connect(node.port());
    raw.handshake(1, "flaky", 40_102);
    assert!(wait_until(WAIT, || node.network.peer_by_id("flaky").is_some()));
    let session = node.network.peer_by_id("flaky").unwrap();

    let transfer = Arc::new(DataTransfer::new(ContentHash::of(b"never sent")));
    session.request_data(transfer.clone()).unwrap();
    raw.recv_command("requestData").unwrap();
    drop(raw);

    assert_eq!(transfer.wait(WAIT), TransferStatus::Error);
    assert!(matches!(
        session.send_message(&ControlMessage::ping()),
        Err(GeoWebError::SessionClosed)
    ));
}

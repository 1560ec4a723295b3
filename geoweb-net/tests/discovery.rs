//! Candidate-driven discovery and persistence across restarts.

mod common;

use {
    common::*,
    geoweb_net::{
        CandidatePersistence, FilePersistence, GeoWebConfig, MemoryPersistence, Tier,
        TieredAddresses,
    },
    std::{net::TcpListener, sync::Arc},
};

fn dead_address() -> String {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    format!("127.0.0.1:{port}")
}

#[test]
fn test_discovery_dials_stored_candidates() {
    init_logging();
    let known = spawn_node(1);
    let persistence = Arc::new(MemoryPersistence::new(TieredAddresses {
        recent: vec![known.address()],
        ..TieredAddresses::default()
    }));
    let node = spawn_node_with(GeoWebConfig::dev_default(1), |builder| {
        builder.candidate_persistence(persistence.clone())
    });

    assert!(wait_until(WAIT, || node
        .network
        .peer_by_id(known.network.session_id())
        .is_some()));
    assert!(wait_until(WAIT, || node.network.candidates().tier_of(&known.address())
        == Some(Tier::Current)));

    node.network.shutdown();
    let saved = persistence.stored();
    assert_eq!(saved.current, vec![known.address()]);
    assert!(saved.recent.is_empty());
}

#[test]
fn test_unreachable_candidate_is_demoted() {
    init_logging();
    let dead = dead_address();
    let persistence = Arc::new(MemoryPersistence::new(TieredAddresses {
        current: vec![dead.clone()],
        ..TieredAddresses::default()
    }));
    let node = spawn_node_with(GeoWebConfig::dev_default(1), |builder| {
        builder.candidate_persistence(persistence)
    });

    assert!(wait_until(WAIT, || node.network.candidates().tier_of(&dead)
        == Some(Tier::Recent)));
    assert_eq!(node.network.handshaked_count(), 0);
}

#[test]
fn test_file_persistence_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.json");
    let known = spawn_node(1);

    {
        let node = spawn_node_with(GeoWebConfig::dev_default(1), |builder| {
            builder.candidate_persistence(Arc::new(FilePersistence::new(&path)))
        });
        connect(&node, &known);
        assert!(wait_until(WAIT, || node.network.candidates().tier_of(&known.address())
            == Some(Tier::Current)));
        // dropped here: shutdown writes the file
    }

    let stored = FilePersistence::new(&path).load().unwrap();
    assert_eq!(stored.current, vec![known.address()]);

    // a fresh node reads the file back and reconnects on its own
    let restarted = spawn_node_with(GeoWebConfig::dev_default(1), |builder| {
        builder.candidate_persistence(Arc::new(FilePersistence::new(&path)))
    });
    assert_eq!(
        restarted.network.candidates().tier_of(&known.address()),
        Some(Tier::Current)
    );
    assert!(wait_until(WAIT, || restarted
        .network
        .peer_by_id(known.network.session_id())
        .is_some()));
}

//! Control-message dispatch.
//!
//! Runs on the worker pool, once per decoded control payload:
//!
//! 1. Parse the JSON object; malformed payloads and messages without a
//!    `command` are dropped.
//! 2. `handshake` is processed on any session and goes no further.  Every
//!    other message is dropped until the session has handshaked.
//! 3. A `respUid` completes the matching synchronous request.
//! 4. The application's [`MessageHandler`] sees every message from a
//!    handshaked, still open session, built-in or not.
//!
//! ## Handshake
//!
//! | Check                                   | On failure                        |
//! |-----------------------------------------|-----------------------------------|
//! | `netId` equals ours                     | close                             |
//! | `id` present                            | close                             |
//! | `id` is not ours and not already in use | block both addresses, then close  |
//!
//! On success the session leaves the pending set, records the advertised
//! hostname/port, answers with our own handshake if it has not gone out
//! yet, enters the directory and its address is promoted to the `current`
//! candidate tier.

use {
    crate::{
        address,
        events::{DataRequest, NetworkEvent},
        message::{fields, Command, ControlMessage},
        network::NetworkCore,
        session::PeerSession,
        transfer::ContentHash,
    },
    log::{debug, info, trace, warn},
    serde_json::Value,
    std::sync::Arc,
};

/// Application hook for control messages.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &ControlMessage, peer: &Arc<PeerSession>);
}

impl<F> MessageHandler for F
where
    F: Fn(&ControlMessage, &Arc<PeerSession>) + Send + Sync,
{
    fn on_message(&self, message: &ControlMessage, peer: &Arc<PeerSession>) {
        self(message, peer)
    }
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl MessageHandler for NoopHandler {
    fn on_message(&self, _message: &ControlMessage, _peer: &Arc<PeerSession>) {}
}

/// Process one control payload received from `peer`.
pub(crate) fn process_message(core: &NetworkCore, peer: &Arc<PeerSession>, payload: &[u8]) {
    if peer.is_closed() {
        return;
    }
    let message = match ControlMessage::from_bytes(payload) {
        Ok(message) => message,
        Err(e) => {
            debug!("dropping malformed message from {}: {}", peer.address(), e);
            return;
        }
    };
    let Some(command) = message.command() else {
        debug!("dropping message without command from {}", peer.address());
        return;
    };
    trace!("{} from {}", command, peer.address());

    if message.builtin_command() == Some(Command::Handshake) {
        handle_handshake(core, peer, &message);
        return;
    }
    if !peer.is_handshaked() {
        debug!("ignoring {} from {} before handshake", command, peer.address());
        return;
    }

    match message.builtin_command() {
        Some(Command::GetAddr) => handle_getaddr(core, peer, &message),
        Some(Command::Addr) => handle_addr(core, peer, &message),
        Some(Command::Ping) => {
            if let Err(e) = peer.respond_to_message(ControlMessage::pong(), &message) {
                debug!("pong to {} failed: {}", peer.address(), e);
            }
        }
        Some(Command::Pong) => peer.set_responded_to_heartbeat(true),
        Some(Command::AcceptBroadcast) => match message.get_bool(fields::VALUE) {
            Some(value) => peer.set_can_broadcast(value),
            None => debug!("acceptBroadcast without boolean value from {}", peer.address()),
        },
        Some(Command::RequestData) => handle_request_data(core, peer, &message),
        Some(Command::Handshake) | None => {}
    }
    if peer.is_closed() {
        return;
    }

    if let Some(uid) = message.get_str(fields::RESP_UID) {
        peer.complete_request(uid, message.clone());
    }

    core.handler.on_message(&message, peer);
}

fn handle_handshake(core: &NetworkCore, peer: &Arc<PeerSession>, message: &ControlMessage) {
    if !peer.begin_handshake() {
        trace!("repeated handshake from {}", peer.address());
        return;
    }
    if message.get_i64(fields::NET_ID) != Some(core.config.net_id) {
        info!(
            "{} is on another network ({:?}), closing",
            peer.effective_address(),
            message.get(fields::NET_ID)
        );
        peer.end();
        return;
    }
    let Some(remote_id) = message.get_str(fields::ID) else {
        debug!("handshake without id from {}", peer.effective_address());
        peer.end();
        return;
    };

    if let Some(hostname) = message.get_str(fields::HOSTNAME) {
        peer.set_hostname(hostname);
    }
    if let Some(port) = message.get_i64(fields::PORT) {
        peer.set_port(port);
    }
    let advertised = peer.address();

    if remote_id == core.session_id || core.directory.contains_id(remote_id) {
        if remote_id == core.session_id {
            info!("{} is ourselves, blocking", advertised);
        } else {
            info!("{} duplicates session {}, blocking", advertised, remote_id);
        }
        core.directory.block(&peer.effective_address());
        core.directory.block(&advertised);
        peer.end();
        return;
    }

    core.directory.remove_pending(peer);
    if message.get_bool(fields::ACCEPTS_BROADCAST) == Some(false) {
        peer.set_can_broadcast(false);
    }
    peer.mark_handshaked(remote_id);
    if let Err(e) = peer.send_handshake(&core.handshake_message()) {
        debug!("handshake reply to {} failed: {}", advertised, e);
        peer.end();
        return;
    }
    if let Err(conflict) = core.directory.register(peer, &advertised, remote_id) {
        warn!("could not register {}: {:?}", advertised, conflict);
        peer.end();
        return;
    }
    // shutdown may have collected sessions while this one was in no map
    if core.is_exiting() {
        core.close_session(peer);
    }
    // closed while registering: undo
    if peer.is_closed() {
        core.directory.remove(peer);
        return;
    }
    core.candidates.promote(&advertised);
    info!("handshaked with {} ({})", advertised, remote_id);
    core.publish(NetworkEvent::PeerHandshaked(peer.clone()));
}

fn handle_getaddr(core: &NetworkCore, peer: &Arc<PeerSession>, message: &ControlMessage) {
    let addresses = core.directory.addresses_excluding(std::slice::from_ref(peer));
    if addresses.is_empty() {
        return;
    }
    if let Err(e) = peer.respond_to_message(ControlMessage::addr(&addresses, false), message) {
        debug!("addr reply to {} failed: {}", peer.address(), e);
    }
}

fn handle_addr(core: &NetworkCore, peer: &Arc<PeerSession>, message: &ControlMessage) {
    let Some(entries) = message.get_array(fields::ADDRESSES) else {
        return;
    };
    for entry in entries.iter().filter_map(Value::as_str) {
        let Ok((host, port)) = address::parse_address(entry) else {
            trace!("skipping invalid gossiped address {:?}", entry);
            continue;
        };
        if core.is_self_address(&host, port) {
            continue;
        }
        if core.below_target() && !core.directory.is_known(entry) {
            if let Err(e) = core.connect_to(&host, port) {
                debug!("gossiped address {} unreachable: {}", entry, e);
            }
        }
        core.candidates.register(entry);
    }

    if message.get_bool(fields::SHARE) == Some(true) {
        let mut relay = message.clone();
        relay.remove(fields::SHARE);
        relay.remove(fields::REQ_UID);
        relay.remove(fields::RESP_UID);
        let relayed = core.broadcast(&relay, std::slice::from_ref(peer));
        trace!("relayed addr from {} to {} peers", peer.address(), relayed);
    }
}

fn handle_request_data(core: &NetworkCore, peer: &Arc<PeerSession>, message: &ControlMessage) {
    let Some(hash) = message
        .get_str(fields::HASH)
        .and_then(|hash| hash.parse::<ContentHash>().ok())
    else {
        debug!("requestData without valid hash from {}", peer.address());
        return;
    };
    core.publish(NetworkEvent::DataRequested(DataRequest::new(
        hash,
        peer.clone(),
    )));
}

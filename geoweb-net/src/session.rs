//! Per-peer session state.
//!
//! A [`PeerSession`] wraps one [`Connection`] and tracks where the peer is
//! in the handshake/liveness state machine:
//!
//! ```text
//! Connecting ──read loop starts──▶ AwaitingHandshake ──valid handshake──▶ Handshaked
//!      │                                  │                                   │
//!      └──────────────────────────────────┴──── I/O error, end(), ───────────┴──▶ Closed
//!                                               heartbeat timeout
//! ```
//!
//! It also owns the two per-peer registries: outstanding synchronous
//! requests (`reqUid` → single-shot reply channel) and requested downloads
//! (content hash → [`DataTransfer`]).

use {
    crate::{
        address,
        connection::Connection,
        error::{GeoWebError, Result},
        message::{fields, ControlMessage, ResponseCode},
        network::NetworkCore,
        transfer::{ContentHash, DataTransfer},
    },
    crossbeam_channel::{bounded, RecvTimeoutError, Sender},
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt,
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Weak,
        },
        time::{Duration, Instant},
    },
};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingHandshake,
    Handshaked,
    Closed,
}

/// Reply to [`PeerSession::send_sync_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncResponse {
    /// `reqRespCode` of the reply, `Unknown` if it carried none,
    /// `RequestTimeout` if no reply arrived in time.
    pub code: ResponseCode,
    /// The reply itself, absent on timeout.
    pub message: Option<ControlMessage>,
}

impl SyncResponse {
    fn timed_out() -> Self {
        Self {
            code: ResponseCode::RequestTimeout,
            message: None,
        }
    }

    fn from_reply(message: ControlMessage) -> Self {
        let code = message
            .get_i64(fields::REQ_RESP_CODE)
            .map(ResponseCode::from_code)
            .unwrap_or(ResponseCode::Unknown);
        Self {
            code,
            message: Some(message),
        }
    }
}

/// 128 random bits, hex encoded.  Used for session ids and `reqUid`s.
pub(crate) fn random_uid() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// One live (or closed) peer connection.
pub struct PeerSession {
    connection: Connection,
    initiated: bool,
    connected_at: Instant,
    /// Advertised `(host, port)`; starts as the observed socket address and
    /// may be overridden by the peer's handshake.
    advertised: Mutex<(String, u16)>,
    remote_id: Mutex<Option<String>>,
    started: AtomicBool,
    sent_handshake: AtomicBool,
    handshaking: AtomicBool,
    handshaked: AtomicBool,
    can_broadcast: AtomicBool,
    responded_to_heartbeat: AtomicBool,
    closed: AtomicBool,
    pending_requests: Mutex<HashMap<String, Sender<ControlMessage>>>,
    transfers: Mutex<HashMap<ContentHash, Arc<DataTransfer>>>,
    sync_timeout: Duration,
    network: Weak<NetworkCore>,
}

impl PeerSession {
    pub(crate) fn new(
        connection: Connection,
        initiated: bool,
        sync_timeout: Duration,
        network: Weak<NetworkCore>,
    ) -> Self {
        let peer = connection.peer_addr();
        Self {
            connection,
            initiated,
            connected_at: Instant::now(),
            advertised: Mutex::new((peer.ip().to_string(), peer.port())),
            remote_id: Mutex::new(None),
            started: AtomicBool::new(false),
            sent_handshake: AtomicBool::new(false),
            handshaking: AtomicBool::new(false),
            handshaked: AtomicBool::new(false),
            can_broadcast: AtomicBool::new(true),
            responded_to_heartbeat: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pending_requests: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            sync_timeout,
            network,
        }
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// The socket address actually dialed or accepted.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// `ip:port` of the socket, the key of the pending set.
    pub fn effective_address(&self) -> String {
        self.remote_addr().to_string()
    }

    /// The `host:port` the peer advertised (or the observed address when it
    /// advertised nothing).
    pub fn address(&self) -> String {
        let (host, port) = &*self.advertised.lock();
        address::format_address(host, *port)
    }

    pub fn hostname(&self) -> String {
        self.advertised.lock().0.clone()
    }

    pub fn port(&self) -> u16 {
        self.advertised.lock().1
    }

    /// The peer's session id, known once it handshaked.
    pub fn session_id(&self) -> Option<String> {
        self.remote_id.lock().clone()
    }

    /// Whether this side dialed the connection.
    pub fn is_initiator(&self) -> bool {
        self.initiated
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    // ── State ───────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            SessionState::Closed
        } else if self.is_handshaked() {
            SessionState::Handshaked
        } else if self.started.load(Ordering::Acquire) {
            SessionState::AwaitingHandshake
        } else {
            SessionState::Connecting
        }
    }

    pub fn is_handshaked(&self) -> bool {
        self.handshaked.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether broadcasts are delivered to this peer.
    pub fn can_broadcast(&self) -> bool {
        self.can_broadcast.load(Ordering::Acquire)
    }

    pub fn responded_to_heartbeat(&self) -> bool {
        self.responded_to_heartbeat.load(Ordering::Acquire)
    }

    pub fn sent_handshake(&self) -> bool {
        self.sent_handshake.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Claim the right to process the peer's handshake.  Only the first
    /// caller gets `true`; every later handshake on this session is ignored.
    /// Rejected handshakes close the session, so the claim is never released.
    pub(crate) fn begin_handshake(&self) -> bool {
        self.handshaking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_handshaked(&self, remote_id: &str) {
        *self.remote_id.lock() = Some(remote_id.to_string());
        // a heartbeat may already be in flight; count this peer as alive
        self.responded_to_heartbeat.store(true, Ordering::Release);
        self.handshaked.store(true, Ordering::Release);
    }

    pub(crate) fn set_can_broadcast(&self, value: bool) {
        self.can_broadcast.store(value, Ordering::Release);
    }

    pub(crate) fn set_responded_to_heartbeat(&self, value: bool) {
        self.responded_to_heartbeat.store(value, Ordering::Release);
    }

    /// Clear the heartbeat flag, returning whether the peer had answered.
    pub(crate) fn take_heartbeat_response(&self) -> bool {
        self.responded_to_heartbeat.swap(false, Ordering::AcqRel)
    }

    /// Apply a handshake's `hostname`; invalid values are ignored.
    pub(crate) fn set_hostname(&self, hostname: &str) {
        if address::is_valid_hostname(hostname) {
            self.advertised.lock().0 = hostname.to_string();
        }
    }

    /// Apply a handshake's `port`; out-of-range values are ignored.
    pub(crate) fn set_port(&self, port: i64) {
        if let Ok(port) = u16::try_from(port) {
            if port != 0 {
                self.advertised.lock().1 = port;
            }
        }
    }

    /// Flip to closed.  Returns `true` for the caller that actually closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Send a message without waiting for any reply.
    pub fn send_message(&self, message: &ControlMessage) -> Result<()> {
        if self.is_closed() {
            return Err(GeoWebError::SessionClosed);
        }
        self.connection.send_control(message)
    }

    /// Send our handshake unless it already went out.
    pub(crate) fn send_handshake(&self, handshake: &ControlMessage) -> Result<()> {
        if self.sent_handshake.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_message(handshake)
    }

    /// Send `message` and block until the peer answers it (a reply carrying
    /// our `reqUid` as `respUid`) or the sync timeout elapses.
    ///
    /// Blocks the calling thread; do not call it from an event handler.
    pub fn send_sync_message(&self, mut message: ControlMessage) -> Result<SyncResponse> {
        if message.has(fields::REQ_UID) {
            return Err(GeoWebError::ReservedField(fields::REQ_UID));
        }
        let uid = random_uid();
        message.set(fields::REQ_UID, uid.as_str());

        let (tx, rx) = bounded(1);
        self.pending_requests.lock().insert(uid.clone(), tx);
        if let Err(e) = self.send_message(&message) {
            self.pending_requests.lock().remove(&uid);
            return Err(e);
        }

        match rx.recv_timeout(self.sync_timeout) {
            Ok(reply) => Ok(SyncResponse::from_reply(reply)),
            Err(RecvTimeoutError::Timeout) => {
                self.pending_requests.lock().remove(&uid);
                debug!("sync request {} to {} timed out", uid, self.address());
                Ok(SyncResponse::timed_out())
            }
            Err(RecvTimeoutError::Disconnected) => Err(GeoWebError::SessionClosed),
        }
    }

    /// Answer `request`, echoing its `reqUid` as `respUid`.
    pub fn respond_to_message(
        &self,
        mut response: ControlMessage,
        request: &ControlMessage,
    ) -> Result<()> {
        if let Some(uid) = request.get(fields::REQ_UID) {
            response.set(fields::RESP_UID, uid.clone());
        }
        self.send_message(&response)
    }

    /// Answer `request` with an explicit status code.
    pub fn respond_with_code(
        &self,
        mut response: ControlMessage,
        request: &ControlMessage,
        code: ResponseCode,
    ) -> Result<()> {
        response.set(fields::REQ_RESP_CODE, code.code());
        self.respond_to_message(response, request)
    }

    /// Register `transfer` and ask the peer for its data.
    pub fn request_data(&self, transfer: Arc<DataTransfer>) -> Result<()> {
        let hash = *transfer.hash();
        self.transfers.lock().insert(hash, transfer);
        if let Err(e) = self.send_message(&ControlMessage::request_data(&hash)) {
            self.transfers.lock().remove(&hash);
            return Err(e);
        }
        Ok(())
    }

    /// Upload `data` in answer to a data request.  The data must hash to
    /// `hash`; mismatches are refused before anything is sent.
    pub fn send_data(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        if !hash.matches(data) {
            return Err(GeoWebError::HashMismatch(hash.to_hex()));
        }
        if self.is_closed() {
            return Err(GeoWebError::SessionClosed);
        }
        self.connection.send_data(hash, data)
    }

    /// Close the session: leave the directory, close the socket and notify
    /// listeners.  Idempotent.
    pub fn end(self: &Arc<Self>) {
        match self.network.upgrade() {
            Some(network) => network.close_session(self),
            None => {
                if self.mark_closed() {
                    self.connection.shutdown();
                    self.fail_pending_requests();
                }
            }
        }
    }

    // ── Registries ──────────────────────────────────────────────────────

    /// Deliver a reply to the request waiting on `uid`, if any.
    pub(crate) fn complete_request(&self, uid: &str, reply: ControlMessage) {
        match self.pending_requests.lock().remove(uid) {
            Some(tx) => {
                let _ = tx.try_send(reply);
            }
            None => trace!("unsolicited response {} from {}", uid, self.address()),
        }
    }

    /// Drop every waiting sync request; their callers see `SessionClosed`.
    pub(crate) fn fail_pending_requests(&self) {
        self.pending_requests.lock().clear();
    }

    /// Finish every requested download that never started.  Called when
    /// the session closes so waiters do not hang.
    pub(crate) fn abandon_transfers(&self) {
        let abandoned: Vec<_> = self.transfers.lock().drain().map(|(_, t)| t).collect();
        for transfer in abandoned {
            transfer.finish(Vec::new());
        }
    }

    /// Remove and return the transfer registered for `hash`.
    pub(crate) fn claim_transfer(&self, hash: &ContentHash) -> Option<Arc<DataTransfer>> {
        self.transfers.lock().remove(hash)
    }

    /// Number of downloads requested but not yet started.
    pub fn pending_transfers(&self) -> usize {
        self.transfers.lock().len()
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote_addr())
            .field("address", &self.address())
            .field("session_id", &self.session_id())
            .field("state", &self.state())
            .field("initiated", &self.initiated)
            .finish()
    }
}

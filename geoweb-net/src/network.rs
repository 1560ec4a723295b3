//! Network orchestrator: listener, session registry, outbound dialing,
//! broadcast and shutdown.
//!
//! A [`Network`] is built once per node with a [`NetworkBuilder`] and owns
//! every component explicitly; collaborators reach the directory and the
//! candidate store through one shared `NetworkCore` handle, never through
//! global state.
//!
//! ## Threads
//!
//! | Thread            | Count         | Role                                   |
//! |-------------------|---------------|----------------------------------------|
//! | `geowebAcceptor`  | 1             | accepts inbound sockets                |
//! | `geowebPeer`      | 1 per session | blocking frame read loop               |
//! | `geowebWorker`    | ≤ pool size   | protocol dispatch + application hook   |
//! | `geowebEvents`    | 1             | sequential event delivery              |
//! | `geowebDiscovery` | 1             | dials candidates while below target    |
//! | `geowebGossip`    | 1             | periodic `getaddr` + candidate save    |
//! | `geowebHeartbeat` | 1             | ping / sweep liveness                  |
//!
//! Timer threads wait on a shutdown channel whose sender is dropped by
//! [`Network::shutdown`], which wakes all of them at once.

use {
    crate::{
        address,
        candidates::{CandidatePersistence, CandidateStore, MemoryPersistence},
        config::GeoWebConfig,
        connection::{Connection, FrameHandler},
        directory::PeerDirectory,
        discovery, dispatcher,
        dispatcher::{MessageHandler, NoopHandler},
        error::{GeoWebError, Result},
        events::{self, EventHandlers, EventSink, NetworkEvent},
        heartbeat::{self, HeartbeatPhase},
        message::ControlMessage,
        session::{random_uid, PeerSession},
        transfer::{ContentHash, DataTransfer},
        worker_pool::WorkerPool,
    },
    crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender},
    log::{debug, info, trace, warn},
    parking_lot::Mutex,
    std::{
        io,
        net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Weak,
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Pause after a failed `accept()` so a persistent error (e.g. out of file
/// descriptors) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Block for `timeout` or until the shutdown channel disconnects.  Returns
/// `true` on shutdown.
pub(crate) fn wait_for_shutdown(shutdown: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(shutdown.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

// ── Core ────────────────────────────────────────────────────────────────

/// State shared by every thread of one network.
pub(crate) struct NetworkCore {
    pub(crate) config: GeoWebConfig,
    pub(crate) session_id: String,
    pub(crate) local_port: u16,
    pub(crate) directory: PeerDirectory,
    pub(crate) candidates: CandidateStore,
    pub(crate) handler: Arc<dyn MessageHandler>,
    persistence: Arc<dyn CandidatePersistence>,
    events: Arc<dyn EventSink>,
    workers: WorkerPool,
    exit: AtomicBool,
    this: Weak<NetworkCore>,
}

impl NetworkCore {
    pub(crate) fn is_exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub(crate) fn publish(&self, event: NetworkEvent) {
        self.events.publish(event);
    }

    pub(crate) fn below_target(&self) -> bool {
        self.directory.handshaked_count() < self.config.peer_count_target
    }

    /// Our handshake, advertising the port we actually bound.
    pub(crate) fn handshake_message(&self) -> ControlMessage {
        ControlMessage::handshake(
            self.config.net_id,
            &self.session_id,
            &self.config.hostname,
            self.local_port,
            self.config.accepts_broadcast,
        )
    }

    /// Whether `host:port` obviously names this node.  Addresses that only
    /// turn out to be us after connecting are caught by the handshake.
    pub(crate) fn is_self_address(&self, host: &str, port: u16) -> bool {
        if port != self.local_port {
            return false;
        }
        if host == "localhost" || (!self.config.hostname.is_empty() && host == self.config.hostname)
        {
            return true;
        }
        host.parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified())
    }

    fn is_self_socket(&self, addr: &SocketAddr) -> bool {
        addr.port() == self.local_port && (addr.ip().is_loopback() || addr.ip().is_unspecified())
    }

    pub(crate) fn save_candidates(&self) {
        // failures are logged by the store
        let _ = self.candidates.save_to(self.persistence.as_ref());
    }

    /// Dial `host:port` and start a session.  A failed dial demotes the
    /// address in the candidate store.
    pub(crate) fn connect_to(&self, host: &str, port: u16) -> Result<Arc<PeerSession>> {
        if self.is_exiting() {
            return Err(GeoWebError::Shutdown);
        }
        let requested = address::format_address(host, port);
        if port == 0 || !address::is_valid_hostname(host) {
            return Err(GeoWebError::InvalidAddress(requested));
        }
        if self.directory.is_blocked(&requested) {
            return Err(GeoWebError::Blocked(requested));
        }
        if self.is_self_address(host, port) {
            return Err(GeoWebError::SelfConnection(requested));
        }

        let target = match resolve(host, port) {
            Ok(target) => target,
            Err(e) => {
                self.candidates.demote(&requested);
                return Err(e);
            }
        };
        let resolved = target.to_string();
        if self.directory.is_blocked(&resolved) {
            return Err(GeoWebError::Blocked(resolved));
        }
        if self.is_self_socket(&target) {
            return Err(GeoWebError::SelfConnection(resolved));
        }
        if self.directory.is_known(&requested)
            || self.directory.is_known(&resolved)
            || !self.directory.begin_dial(&resolved)
        {
            return Err(GeoWebError::AlreadyConnected(requested));
        }

        debug!("connecting to {}", requested);
        let outcome = match TcpStream::connect_timeout(&target, self.config.connect_timeout()) {
            Ok(stream) => self.register_stream(stream, true),
            Err(e) => {
                self.candidates.demote(&requested);
                Err(GeoWebError::ConnectionFailed(target, e.to_string()))
            }
        };
        self.directory.end_dial(&resolved);
        outcome
    }

    /// Wrap a connected socket in a session, announce it and start its
    /// read loop.  Outbound sessions send their handshake immediately.
    pub(crate) fn register_stream(
        &self,
        stream: TcpStream,
        initiated: bool,
    ) -> Result<Arc<PeerSession>> {
        let core = self.this.upgrade().ok_or(GeoWebError::Shutdown)?;
        let connection = Connection::new(stream, self.config.max_frame_size)?;
        let session = Arc::new(PeerSession::new(
            connection,
            initiated,
            self.config.sync_message_timeout(),
            self.this.clone(),
        ));
        self.directory.add_pending(&session);
        if self.is_exiting() {
            self.close_session(&session);
            return Err(GeoWebError::Shutdown);
        }
        debug!(
            "{} connection with {}",
            if initiated { "outbound" } else { "inbound" },
            session.effective_address()
        );
        self.publish(NetworkEvent::PeerConnected(session.clone()));

        if initiated {
            if let Err(e) = session.send_handshake(&self.handshake_message()) {
                self.close_session(&session);
                return Err(e);
            }
        }

        let reader_session = session.clone();
        let spawned = thread::Builder::new()
            .name("geowebPeer".to_string())
            .spawn(move || run_reader(&core, &reader_session));
        if let Err(e) = spawned {
            self.close_session(&session);
            return Err(e.into());
        }
        Ok(session)
    }

    /// Close `session`: directory first, then the socket, then waiting
    /// callers, then the `PeerDisconnected` event.  Idempotent.
    pub(crate) fn close_session(&self, session: &Arc<PeerSession>) {
        if !session.mark_closed() {
            return;
        }
        self.directory.remove(session);
        session.connection().shutdown();
        session.fail_pending_requests();
        session.abandon_transfers();
        info!("disconnected from {}", session.address());
        self.publish(NetworkEvent::PeerDisconnected(session.clone()));
    }

    /// Send `message` to every handshaked peer that accepts broadcasts,
    /// except those in `exclude`.  Returns how many sends succeeded.
    pub(crate) fn broadcast(&self, message: &ControlMessage, exclude: &[Arc<PeerSession>]) -> usize {
        let mut sent = 0usize;
        for session in self.directory.sessions() {
            if session.is_closed()
                || !session.can_broadcast()
                || exclude.iter().any(|s| Arc::ptr_eq(s, &session))
            {
                continue;
            }
            match session.send_message(message) {
                Ok(()) => sent = sent.saturating_add(1),
                Err(e) => debug!("broadcast to {} failed: {}", session.address(), e),
            }
        }
        sent
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| GeoWebError::InvalidAddress(address::format_address(host, port)))
}

/// Routes one session's frames: control payloads to the worker pool, data
/// frames to the session's transfer registry.
struct SessionFrames<'a> {
    core: &'a Arc<NetworkCore>,
    session: &'a Arc<PeerSession>,
}

impl FrameHandler for SessionFrames<'_> {
    fn on_control(&self, payload: Vec<u8>) {
        let core = self.core.clone();
        let session = self.session.clone();
        let queued = self
            .core
            .workers
            .submit(move || dispatcher::process_message(&core, &session, &payload));
        if !queued {
            trace!("worker pool closed, dropping message");
        }
    }

    fn claim_transfer(&self, hash: &ContentHash) -> Option<Arc<DataTransfer>> {
        self.session.claim_transfer(hash)
    }
}

fn run_reader(core: &Arc<NetworkCore>, session: &Arc<PeerSession>) {
    session.mark_started();
    let frames = SessionFrames { core, session };
    match session.connection().run_read_loop(&frames) {
        Ok(()) => debug!("{} closed the connection", session.effective_address()),
        Err(e) if session.is_closed() => trace!("read loop ended after close: {}", e),
        Err(e) => debug!("read from {} failed: {}", session.effective_address(), e),
    }
    core.close_session(session);
}

fn spawn_acceptor(core: Arc<NetworkCore>, listener: TcpListener) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("geowebAcceptor".to_string())
        .spawn(move || run_acceptor(&core, &listener))
}

fn run_acceptor(core: &NetworkCore, listener: &TcpListener) {
    for stream in listener.incoming() {
        if core.is_exiting() {
            break;
        }
        match stream {
            Ok(stream) => {
                if let Err(e) = core.register_stream(stream, false) {
                    debug!("rejected inbound connection: {}", e);
                }
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
    debug!("acceptor stopped");
}

// ── Builder ─────────────────────────────────────────────────────────────

/// Assembles a [`Network`].
///
/// ```no_run
/// use geoweb_net::{EventHandlers, GeoWebConfig, Network};
///
/// let network = Network::builder(GeoWebConfig::new(42))
///     .event_handlers(
///         EventHandlers::new().on_peer_handshaked(|peer| println!("hello {}", peer.address())),
///     )
///     .build()?;
/// network.connect_to("seed.example.com", 25565)?;
/// # Ok::<(), geoweb_net::GeoWebError>(())
/// ```
pub struct NetworkBuilder {
    config: GeoWebConfig,
    handler: Arc<dyn MessageHandler>,
    handlers: EventHandlers,
    sink: Option<Arc<dyn EventSink>>,
    persistence: Arc<dyn CandidatePersistence>,
}

impl NetworkBuilder {
    pub fn new(config: GeoWebConfig) -> Self {
        Self {
            config,
            handler: Arc::new(NoopHandler),
            handlers: EventHandlers::new(),
            sink: None,
            persistence: Arc::new(MemoryPersistence::default()),
        }
    }

    /// Hook called for every parsed control message.
    pub fn message_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Callbacks run by the event delivery thread.
    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Send events to `sink` instead of the built-in delivery thread.
    /// Handlers set with [`Self::event_handlers`] are then unused.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Where candidate addresses are loaded from and saved to.  Defaults
    /// to memory only.
    pub fn candidate_persistence(mut self, persistence: Arc<dyn CandidatePersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Validate the config, bind the listener, load candidates and start
    /// the background threads.
    pub fn build(self) -> Result<Network> {
        let started = Instant::now();
        self.config.validate()?;

        let port = self.config.listen_port;
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|e| GeoWebError::PortUnavailable(port, e))?;
        let local_addr = listener.local_addr()?;

        let candidates = CandidateStore::new();
        match candidates.load_from(self.persistence.as_ref()) {
            Ok(loaded) => debug!("loaded {} candidate addresses", loaded),
            Err(e) => warn!("could not load candidate addresses: {}", e),
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut threads = Vec::new();
        let events: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => {
                let (publisher, handle) =
                    events::spawn_event_loop(self.handlers, shutdown_rx.clone())?;
                threads.push(handle);
                Arc::new(publisher)
            }
        };

        let workers = WorkerPool::new(
            "geowebWorker",
            self.config.worker_pool_size,
            Duration::from_millis(self.config.worker_keep_alive_ms),
        );
        let core = Arc::new_cyclic(|this| NetworkCore {
            session_id: random_uid(),
            local_port: local_addr.port(),
            directory: PeerDirectory::new(),
            candidates,
            handler: self.handler,
            persistence: self.persistence,
            events,
            workers,
            exit: AtomicBool::new(false),
            this: this.clone(),
            config: self.config,
        });
        let network = Network {
            core: core.clone(),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            threads: Mutex::new(threads),
            local_addr,
        };

        // an early return drops `network`, which shuts down whatever started
        network.track(spawn_acceptor(core.clone(), listener)?);
        network.track(discovery::spawn_discovery(core.clone(), shutdown_rx.clone())?);
        network.track(discovery::spawn_gossip(core.clone(), shutdown_rx.clone())?);
        network.track(heartbeat::spawn_heartbeat(core.clone(), shutdown_rx)?);

        info!(
            "network {} listening on {} as {}",
            core.config.net_id, local_addr, core.session_id
        );
        core.publish(NetworkEvent::SetupComplete(started.elapsed()));
        Ok(network)
    }
}

// ── Network ─────────────────────────────────────────────────────────────

/// A running GeoWeb node.  Dropping it shuts it down.
pub struct Network {
    core: Arc<NetworkCore>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl Network {
    pub fn builder(config: GeoWebConfig) -> NetworkBuilder {
        NetworkBuilder::new(config)
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.threads.lock().push(handle);
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Random 128-bit id of this node for this process lifetime.
    pub fn session_id(&self) -> &str {
        &self.core.session_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The bound listening port (resolved when configured as `0`).
    pub fn port(&self) -> u16 {
        self.core.local_port
    }

    pub fn config(&self) -> &GeoWebConfig {
        &self.core.config
    }

    // ── Peers ───────────────────────────────────────────────────────────

    /// Dial a peer.  Returns once the TCP connection is up and our
    /// handshake is sent; the `PeerHandshaked` event follows when the
    /// peer answers.
    pub fn connect_to(&self, host: &str, port: u16) -> Result<Arc<PeerSession>> {
        self.core.connect_to(host, port)
    }

    /// Handshaked sessions.
    pub fn peers(&self) -> Vec<Arc<PeerSession>> {
        self.core.directory.sessions()
    }

    pub fn peer(&self, address: &str) -> Option<Arc<PeerSession>> {
        self.core.directory.get(address)
    }

    pub fn peer_by_id(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.core.directory.get_by_id(session_id)
    }

    /// Advertised addresses of the handshaked peers.
    pub fn peer_addresses(&self) -> Vec<String> {
        self.core.directory.addresses_excluding(&[])
    }

    pub fn handshaked_count(&self) -> usize {
        self.core.directory.handshaked_count()
    }

    /// Connections still waiting for a handshake.
    pub fn pending_count(&self) -> usize {
        self.core.directory.pending_count()
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.core.directory.is_blocked(address)
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Send `message` to every handshaked peer that accepts broadcasts.
    pub fn broadcast(&self, message: &ControlMessage) -> usize {
        self.core.broadcast(message, &[])
    }

    /// Like [`Self::broadcast`] but skipping `exclude`.
    pub fn broadcast_except(&self, message: &ControlMessage, exclude: &[Arc<PeerSession>]) -> usize {
        self.core.broadcast(message, exclude)
    }

    // ── Discovery and liveness ──────────────────────────────────────────

    pub fn candidates(&self) -> &CandidateStore {
        &self.core.candidates
    }

    pub fn save_candidates(&self) {
        self.core.save_candidates();
    }

    /// Run a gossip round now instead of waiting for the timer.
    pub fn gossip_now(&self) {
        discovery::gossip_tick(&self.core);
    }

    /// Run a heartbeat phase now instead of waiting for the timer.
    pub fn run_heartbeat(&self, phase: HeartbeatPhase) {
        heartbeat::run_phase(&self.core, phase);
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    pub fn is_shut_down(&self) -> bool {
        self.core.is_exiting()
    }

    /// Close every session, stop the background threads and save the
    /// candidate store.  Idempotent.
    pub fn shutdown(&self) {
        if self.core.exit.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down network on port {}", self.core.local_port);

        for session in self.core.directory.all_sessions() {
            self.core.close_session(&session);
        }
        self.shutdown_tx.lock().take();
        // unblock accept()
        let wake = SocketAddr::from((Ipv4Addr::LOCALHOST, self.core.local_port));
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            debug!("acceptor wake-up failed: {}", e);
        }

        let current = thread::current().id();
        let handles: Vec<_> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("background thread panicked");
            }
        }

        self.core.save_candidates();
        self.core.workers.shutdown();
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.shutdown();
    }
}

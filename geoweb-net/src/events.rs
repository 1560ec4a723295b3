//! Lifecycle notifications.
//!
//! The core publishes [`NetworkEvent`]s through an [`EventSink`]; it never
//! calls application code directly.  The default sink is an
//! [`EventPublisher`] feeding a single delivery thread which looks each
//! event up in an [`EventHandlers`] table, so handlers for one network
//! never run concurrently with each other.
//!
//! ```text
//!  read loops / workers / timers
//!          │ publish(NetworkEvent)
//!          ▼
//!   crossbeam channel ──▶ geowebEvents thread ──▶ EventHandlers slot
//! ```

use {
    crate::{
        error::Result,
        session::PeerSession,
        transfer::ContentHash,
    },
    crossbeam_channel::{select, unbounded, Receiver, Sender},
    log::{debug, error, trace},
    std::{
        fmt,
        io,
        panic::{self, AssertUnwindSafe},
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// A peer asked us for the data behind `hash`.
#[derive(Clone)]
pub struct DataRequest {
    hash: ContentHash,
    peer: Arc<PeerSession>,
}

impl DataRequest {
    pub fn new(hash: ContentHash, peer: Arc<PeerSession>) -> Self {
        Self { hash, peer }
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn peer(&self) -> &Arc<PeerSession> {
        &self.peer
    }

    /// Answer the request.  Fails with `HashMismatch` (sending nothing) if
    /// `data` does not hash to the requested value.
    pub fn upload(&self, data: &[u8]) -> Result<()> {
        self.peer.send_data(&self.hash, data)
    }
}

impl fmt::Debug for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataRequest")
            .field("hash", &self.hash)
            .field("peer", &self.peer.address())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// The listener is bound and the background threads are running.
    SetupComplete(Duration),
    /// A socket was accepted or dialed; no handshake yet.
    PeerConnected(Arc<PeerSession>),
    /// A session closed.  Published exactly once per session.
    PeerDisconnected(Arc<PeerSession>),
    /// A session completed its handshake.
    PeerHandshaked(Arc<PeerSession>),
    DataRequested(DataRequest),
}

impl NetworkEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetupComplete(_) => "setup_complete",
            Self::PeerConnected(_) => "peer_connected",
            Self::PeerDisconnected(_) => "peer_disconnected",
            Self::PeerHandshaked(_) => "peer_handshaked",
            Self::DataRequested(_) => "data_requested",
        }
    }
}

/// Where the core sends events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: NetworkEvent);
}

/// Channel-backed sink.
#[derive(Clone)]
pub struct EventPublisher {
    sender: Sender<NetworkEvent>,
}

impl EventPublisher {
    pub fn new(sender: Sender<NetworkEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for EventPublisher {
    fn publish(&self, event: NetworkEvent) {
        trace!("publishing {}", event.name());
        if self.sender.send(event).is_err() {
            debug!("event dropped, delivery thread is gone");
        }
    }
}

type SessionHandler = Box<dyn Fn(&Arc<PeerSession>) + Send + Sync>;

/// One optional handler per event kind.
#[derive(Default)]
pub struct EventHandlers {
    setup_complete: Option<Box<dyn Fn(Duration) + Send + Sync>>,
    peer_connected: Option<SessionHandler>,
    peer_disconnected: Option<SessionHandler>,
    peer_handshaked: Option<SessionHandler>,
    data_requested: Option<Box<dyn Fn(&DataRequest) + Send + Sync>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_setup_complete(mut self, f: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.setup_complete = Some(Box::new(f));
        self
    }

    pub fn on_peer_connected(
        mut self,
        f: impl Fn(&Arc<PeerSession>) + Send + Sync + 'static,
    ) -> Self {
        self.peer_connected = Some(Box::new(f));
        self
    }

    pub fn on_peer_disconnected(
        mut self,
        f: impl Fn(&Arc<PeerSession>) + Send + Sync + 'static,
    ) -> Self {
        self.peer_disconnected = Some(Box::new(f));
        self
    }

    pub fn on_peer_handshaked(
        mut self,
        f: impl Fn(&Arc<PeerSession>) + Send + Sync + 'static,
    ) -> Self {
        self.peer_handshaked = Some(Box::new(f));
        self
    }

    pub fn on_data_requested(mut self, f: impl Fn(&DataRequest) + Send + Sync + 'static) -> Self {
        self.data_requested = Some(Box::new(f));
        self
    }

    /// Run the handler registered for `event`, if any.
    pub fn dispatch(&self, event: &NetworkEvent) {
        match event {
            NetworkEvent::SetupComplete(elapsed) => {
                if let Some(f) = &self.setup_complete {
                    f(*elapsed);
                }
            }
            NetworkEvent::PeerConnected(peer) => {
                if let Some(f) = &self.peer_connected {
                    f(peer);
                }
            }
            NetworkEvent::PeerDisconnected(peer) => {
                if let Some(f) = &self.peer_disconnected {
                    f(peer);
                }
            }
            NetworkEvent::PeerHandshaked(peer) => {
                if let Some(f) = &self.peer_handshaked {
                    f(peer);
                }
            }
            NetworkEvent::DataRequested(request) => {
                if let Some(f) = &self.data_requested {
                    f(request);
                }
            }
        }
    }
}

/// Spawn the delivery thread.  It exits when `shutdown` disconnects,
/// after delivering whatever was already queued.
pub(crate) fn spawn_event_loop(
    handlers: EventHandlers,
    shutdown: Receiver<()>,
) -> io::Result<(EventPublisher, JoinHandle<()>)> {
    let (sender, receiver) = unbounded();
    let handle = thread::Builder::new()
        .name("geowebEvents".to_string())
        .spawn(move || run_event_loop(&handlers, &receiver, &shutdown))?;
    Ok((EventPublisher::new(sender), handle))
}

fn run_event_loop(
    handlers: &EventHandlers,
    receiver: &Receiver<NetworkEvent>,
    shutdown: &Receiver<()>,
) {
    loop {
        select! {
            recv(receiver) -> event => match event {
                Ok(event) => deliver(handlers, &event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for event in receiver.try_iter() {
                    deliver(handlers, &event);
                }
                break;
            }
        }
    }
    debug!("event delivery stopped");
}

fn deliver(handlers: &EventHandlers, event: &NetworkEvent) {
    if panic::catch_unwind(AssertUnwindSafe(|| handlers.dispatch(event))).is_err() {
        error!("{} handler panicked", event.name());
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::session::tests::detached_session,
        crossbeam_channel::bounded,
        parking_lot::Mutex,
    };

    #[test]
    fn test_handlers_receive_matching_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = {
            let (a, b, c) = (seen.clone(), seen.clone(), seen.clone());
            EventHandlers::new()
                .on_setup_complete(move |_| a.lock().push("setup"))
                .on_peer_connected(move |_| b.lock().push("connected"))
                .on_peer_disconnected(move |_| c.lock().push("disconnected"))
        };
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (publisher, handle) = spawn_event_loop(handlers, shutdown_rx).unwrap();
        let (peer, _remote) = detached_session(false);

        publisher.publish(NetworkEvent::SetupComplete(Duration::from_millis(3)));
        publisher.publish(NetworkEvent::PeerConnected(peer.clone()));
        // no handler registered: silently skipped
        publisher.publish(NetworkEvent::PeerHandshaked(peer.clone()));
        publisher.publish(NetworkEvent::PeerDisconnected(peer));

        drop(shutdown_tx);
        handle.join().unwrap();
        assert_eq!(*seen.lock(), vec!["setup", "connected", "disconnected"]);
    }

    #[test]
    fn test_panicking_handler_keeps_loop_alive() {
        let count = Arc::new(Mutex::new(0usize));
        let handlers = {
            let count = count.clone();
            EventHandlers::new().on_setup_complete(move |elapsed| {
                if elapsed.is_zero() {
                    panic!("bad handler");
                }
                *count.lock() += 1;
            })
        };
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let (publisher, handle) = spawn_event_loop(handlers, shutdown_rx).unwrap();
        publisher.publish(NetworkEvent::SetupComplete(Duration::ZERO));
        publisher.publish(NetworkEvent::SetupComplete(Duration::from_millis(1)));
        drop(shutdown_tx);
        handle.join().unwrap();
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_data_request_upload_checks_hash() {
        let (peer, _remote) = detached_session(false);
        let request = DataRequest::new(ContentHash::of(b"wanted"), peer);
        assert!(request.upload(b"other").is_err());
        request.upload(b"wanted").unwrap();
    }
}

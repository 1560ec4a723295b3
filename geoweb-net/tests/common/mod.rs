//! Shared helpers for the overlay integration tests.

#![allow(dead_code)]

use {
    crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender},
    geoweb_net::{
        message::{self, Frame},
        ContentHash, ControlMessage, EventSink, GeoWebConfig, Network, NetworkBuilder,
        NetworkEvent, PeerSession,
    },
    std::{
        net::TcpStream,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

pub const WAIT: Duration = Duration::from_secs(5);
const MAX_FRAME: usize = 1_048_576;

pub fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Info)
        .try_init();
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

// ── Nodes ───────────────────────────────────────────────────────────────

/// Forwards every event into a channel the test can read.
struct ChannelSink(Sender<NetworkEvent>);

impl EventSink for ChannelSink {
    fn publish(&self, event: NetworkEvent) {
        let _ = self.0.send(event);
    }
}

pub type Received = (ControlMessage, Arc<PeerSession>);

/// A running network plus everything it reported.
pub struct TestNode {
    pub network: Network,
    pub events: Receiver<NetworkEvent>,
    pub messages: Receiver<Received>,
}

pub fn spawn_node(net_id: i64) -> TestNode {
    spawn_node_with(GeoWebConfig::dev_default(net_id), |builder| builder)
}

/// Build a node, letting the caller adjust the builder (persistence etc.).
/// Events and messages are always captured.
pub fn spawn_node_with(
    config: GeoWebConfig,
    customize: impl FnOnce(NetworkBuilder) -> NetworkBuilder,
) -> TestNode {
    let (event_tx, events) = unbounded();
    let (message_tx, messages) = unbounded();
    let builder = Network::builder(config)
        .event_sink(Arc::new(ChannelSink(event_tx)))
        .message_handler(move |msg: &ControlMessage, peer: &Arc<PeerSession>| {
            let _ = message_tx.send((msg.clone(), peer.clone()));
        });
    let network = customize(builder).build().expect("network starts");
    TestNode {
        network,
        events,
        messages,
    }
}

impl TestNode {
    pub fn port(&self) -> u16 {
        self.network.port()
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port())
    }

    /// Next event matching `pred`, skipping the others.
    pub fn wait_event(
        &self,
        timeout: Duration,
        pred: impl Fn(&NetworkEvent) -> bool,
    ) -> Option<NetworkEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(left) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Next application-visible message with `command`.
    pub fn wait_message(&self, command: &str, timeout: Duration) -> Option<Received> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.messages.recv_timeout(left) {
                Ok((msg, peer)) if msg.command() == Some(command) => return Some((msg, peer)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Messages with `command` received so far.
    pub fn drain_messages(&self, command: &str) -> Vec<Received> {
        self.messages
            .try_iter()
            .filter(|(msg, _)| msg.command() == Some(command))
            .collect()
    }

    /// Events of the given name received so far.
    pub fn count_events(&self, name: &str) -> usize {
        self.events.try_iter().filter(|e| e.name() == name).count()
    }
}

/// `a` dials `b` and both sides finish the handshake.  Returns `a`'s
/// session to `b` and `b`'s session to `a`.
pub fn connect(a: &TestNode, b: &TestNode) -> (Arc<PeerSession>, Arc<PeerSession>) {
    a.network
        .connect_to("127.0.0.1", b.port())
        .expect("dial succeeds");
    let mut sessions = None;
    assert!(
        wait_until(WAIT, || {
            sessions = a
                .network
                .peer_by_id(b.network.session_id())
                .zip(b.network.peer_by_id(a.network.session_id()));
            sessions.is_some()
        }),
        "handshake between {} and {} did not complete",
        a.address(),
        b.address()
    );
    sessions.expect("checked above")
}

// ── Raw peers ───────────────────────────────────────────────────────────

/// A hand-driven protocol peer for exercising misbehaviour.
pub struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("raw connect");
        stream.set_read_timeout(Some(WAIT)).unwrap();
        Self { stream }
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        Self { stream }
    }

    pub fn send(&mut self, msg: &ControlMessage) {
        use std::io::Write;
        let frame = message::encode_control_frame(msg, MAX_FRAME).unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    /// Send a data frame without checking that `data` matches `hash`.
    pub fn send_raw_data(&mut self, hash: &ContentHash, data: &[u8]) {
        use std::io::Write;
        let frame = message::encode_data_frame(hash, data, MAX_FRAME).unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    pub fn recv(&mut self) -> Option<Frame> {
        Frame::read_from(&mut self.stream, MAX_FRAME).ok()
    }

    /// Read frames until a control message with `command` arrives.
    pub fn recv_command(&mut self, command: &str) -> Option<ControlMessage> {
        loop {
            match self.recv()? {
                Frame::Control(msg) if msg.command() == Some(command) => return Some(msg),
                _ => continue,
            }
        }
    }

    /// Handshake as `id`, advertising `port`, and consume the node's reply.
    pub fn handshake(&mut self, net_id: i64, id: &str, port: u16) -> ControlMessage {
        self.send(&ControlMessage::handshake(net_id, id, "", port, true));
        self.recv_command("handshake").expect("node answers the handshake")
    }

    /// Whether the node closed the connection (EOF or reset).
    pub fn is_closed_by_remote(&mut self) -> bool {
        self.recv().is_none()
    }
}

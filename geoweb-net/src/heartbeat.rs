//! Two-phase liveness check.
//!
//! Every `heartbeat_period_ms` the node pings all handshaked peers
//! (**Ping** phase).  `heartbeat_timeout_ms` later it sweeps them
//! (**Sweep** phase): a peer that answered since the previous sweep has its
//! flag cleared for the next round, a peer that did not is closed.  The
//! sweep also closes connections that are still waiting for a handshake
//! after the timeout.
//!
//! ```text
//!  t0            t0+timeout            t0+period     t0+period+timeout
//!  │ Ping        │ Sweep               │ Ping        │ Sweep
//!  ▼             ▼                     ▼             ▼
//! ─┼─────────────┼─────────────────────┼─────────────┼──────▶
//! ```
//!
//! The timing lives in [`HeartbeatSchedule`], a pure state machine; the
//! `geowebHeartbeat` thread only sleeps until its next deadline.

use {
    crate::{
        message::ControlMessage,
        network::{wait_for_shutdown, NetworkCore},
    },
    crossbeam_channel::Receiver,
    log::{debug, info, trace},
    std::{
        io,
        sync::Arc,
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPhase {
    /// Send `ping` to every handshaked peer.
    Ping,
    /// Evict peers that did not answer since the last sweep.
    Sweep,
}

#[derive(Debug, Clone)]
pub struct HeartbeatSchedule {
    period: Duration,
    timeout: Duration,
    next_ping: Instant,
    sweep_at: Option<Instant>,
}

impl HeartbeatSchedule {
    pub fn new(start: Instant, initial_delay: Duration, period: Duration, timeout: Duration) -> Self {
        Self {
            period,
            timeout,
            next_ping: later(start, initial_delay),
            sweep_at: None,
        }
    }

    /// When [`Self::poll`] will next return a phase.
    pub fn next_deadline(&self) -> Instant {
        match self.sweep_at {
            Some(sweep_at) => sweep_at.min(self.next_ping),
            None => self.next_ping,
        }
    }

    /// The phase due at `now`, if any.  A pending sweep always runs before
    /// the next ping.
    pub fn poll(&mut self, now: Instant) -> Option<HeartbeatPhase> {
        if let Some(sweep_at) = self.sweep_at {
            if now >= sweep_at {
                self.sweep_at = None;
                return Some(HeartbeatPhase::Sweep);
            }
        }
        if now >= self.next_ping {
            self.next_ping = later(now, self.period);
            self.sweep_at = Some(later(now, self.timeout));
            return Some(HeartbeatPhase::Ping);
        }
        None
    }
}

fn later(from: Instant, by: Duration) -> Instant {
    from.checked_add(by).unwrap_or(from)
}

pub(crate) fn spawn_heartbeat(
    core: Arc<NetworkCore>,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("geowebHeartbeat".to_string())
        .spawn(move || run_heartbeat(&core, &shutdown))
}

fn run_heartbeat(core: &NetworkCore, shutdown: &Receiver<()>) {
    let mut schedule = HeartbeatSchedule::new(
        Instant::now(),
        Duration::from_millis(core.config.heartbeat_initial_delay_ms),
        core.config.heartbeat_period(),
        core.config.heartbeat_timeout(),
    );
    loop {
        while let Some(phase) = schedule.poll(Instant::now()) {
            run_phase(core, phase);
        }
        let wait = schedule
            .next_deadline()
            .saturating_duration_since(Instant::now());
        if wait_for_shutdown(shutdown, wait) {
            break;
        }
    }
    debug!("heartbeat stopped");
}

/// Run one heartbeat phase now.
pub(crate) fn run_phase(core: &NetworkCore, phase: HeartbeatPhase) {
    match phase {
        HeartbeatPhase::Ping => {
            let sent = send_pings(core);
            trace!("heartbeat ping sent to {} peers", sent);
        }
        HeartbeatPhase::Sweep => {
            let evicted = sweep(core);
            if evicted > 0 {
                info!("heartbeat evicted {} peers", evicted);
            }
        }
    }
}

fn send_pings(core: &NetworkCore) -> usize {
    let ping = ControlMessage::ping();
    core.directory
        .sessions()
        .iter()
        .filter(|session| session.send_message(&ping).is_ok())
        .count()
}

fn sweep(core: &NetworkCore) -> usize {
    let mut evicted = 0usize;
    for session in core.directory.sessions() {
        if !session.take_heartbeat_response() {
            debug!("{} missed its heartbeat", session.address());
            core.close_session(&session);
            evicted = evicted.saturating_add(1);
        }
    }
    let timeout = core.config.heartbeat_timeout();
    for session in core.directory.pending_sessions() {
        if session.connected_at().elapsed() > timeout {
            debug!("{} never handshaked", session.effective_address());
            core.close_session(&session);
            evicted = evicted.saturating_add(1);
        }
    }
    evicted
}

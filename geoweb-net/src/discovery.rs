//! Outbound peer discovery and address gossip.
//!
//! Two background threads keep the overlay at its target size:
//!
//! - **geowebDiscovery** walks the candidate tiers with a
//!   [`DiscoveryCursor`], dialing one address per step while the node has
//!   fewer handshaked peers than `peer_count_target`.  After the `old` tier
//!   is exhausted it sleeps `discovery_backoff_ms` and starts over.
//! - **geowebGossip** fires every `gossip_interval_ms`: it broadcasts
//!   `getaddr` while below target and saves the candidate store.
//!
//! ```text
//!   Current[0..n] ──▶ Recent[0..n] ──▶ Old[0..n] ──▶ Backoff ──┐
//!        ▲                                                     │
//!        └──────────────── fresh snapshot ◀───────────────────┘
//! ```
//!
//! Each pass walks a snapshot taken when the pass starts, so demotions
//! during the pass (a failed dial moves the address down one tier) do not
//! shift the cursor over addresses it has not visited yet.

use {
    crate::{
        address,
        candidates::{Tier, TieredAddresses},
        error::GeoWebError,
        message::ControlMessage,
        network::{wait_for_shutdown, NetworkCore},
    },
    crossbeam_channel::Receiver,
    log::{debug, info, trace},
    std::{
        io,
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// What the discovery loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStep {
    Attempt { tier: Tier, address: String },
    /// Every tier of this pass has been visited.
    Backoff,
}

/// Position in the tiered walk.
#[derive(Debug, Clone)]
pub struct DiscoveryCursor {
    tier: Tier,
    index: usize,
    pass: TieredAddresses,
}

impl DiscoveryCursor {
    pub fn new(pass: TieredAddresses) -> Self {
        Self {
            tier: Tier::Current,
            index: 0,
            pass,
        }
    }

    /// Current `(tier, index)`.
    pub fn position(&self) -> (Tier, usize) {
        (self.tier, self.index)
    }

    pub fn pass_is_empty(&self) -> bool {
        self.pass.is_empty()
    }

    /// Return the next address to try and advance past it, or `Backoff`
    /// once the `old` tier is exhausted.
    pub fn next_step(&mut self) -> CursorStep {
        loop {
            if let Some(address) = self.pass.list(self.tier).get(self.index) {
                let step = CursorStep::Attempt {
                    tier: self.tier,
                    address: address.clone(),
                };
                self.index = self.index.saturating_add(1);
                return step;
            }
            match self.tier.next() {
                Some(next) => {
                    self.tier = next;
                    self.index = 0;
                }
                None => return CursorStep::Backoff,
            }
        }
    }

    /// Start a new pass at `(Current, 0)`.
    pub fn restart(&mut self, pass: TieredAddresses) {
        self.tier = Tier::Current;
        self.index = 0;
        self.pass = pass;
    }
}

// ── Discovery thread ────────────────────────────────────────────────────

pub(crate) fn spawn_discovery(
    core: Arc<NetworkCore>,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("geowebDiscovery".to_string())
        .spawn(move || run_discovery(&core, &shutdown))
}

fn run_discovery(core: &NetworkCore, shutdown: &Receiver<()>) {
    let idle = Duration::from_millis(core.config.discovery_idle_poll_ms);
    let backoff = Duration::from_millis(core.config.discovery_backoff_ms);
    let mut cursor = DiscoveryCursor::new(core.candidates.snapshot());

    loop {
        if core.is_exiting() {
            break;
        }
        if !core.below_target() {
            if wait_for_shutdown(shutdown, idle) {
                break;
            }
            continue;
        }
        if cursor.pass_is_empty() {
            if wait_for_shutdown(shutdown, idle) {
                break;
            }
            cursor.restart(core.candidates.snapshot());
            continue;
        }
        match cursor.next_step() {
            CursorStep::Attempt { tier, address } => attempt(core, tier, &address),
            CursorStep::Backoff => {
                debug!(
                    "discovery pass finished with {} of {} peers, backing off {:?}",
                    core.directory.handshaked_count(),
                    core.config.peer_count_target,
                    backoff
                );
                if wait_for_shutdown(shutdown, backoff) {
                    break;
                }
                cursor.restart(core.candidates.snapshot());
            }
        }
    }
    debug!("discovery stopped");
}

fn attempt(core: &NetworkCore, tier: Tier, candidate: &str) {
    let Ok((host, port)) = address::parse_address(candidate) else {
        return;
    };
    if core.directory.is_known(candidate) {
        return;
    }
    match core.connect_to(&host, port) {
        Ok(session) => info!("discovery connected to {} ({:?})", session.address(), tier),
        Err(
            GeoWebError::AlreadyConnected(_)
            | GeoWebError::Blocked(_)
            | GeoWebError::SelfConnection(_),
        ) => trace!("discovery skipped {}", candidate),
        Err(e) => debug!("discovery could not reach {}: {}", candidate, e),
    }
}

// ── Gossip thread ───────────────────────────────────────────────────────

pub(crate) fn spawn_gossip(
    core: Arc<NetworkCore>,
    shutdown: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("geowebGossip".to_string())
        .spawn(move || run_gossip(&core, &shutdown))
}

fn run_gossip(core: &NetworkCore, shutdown: &Receiver<()>) {
    let initial = Duration::from_millis(core.config.gossip_initial_delay_ms);
    let interval = Duration::from_millis(core.config.gossip_interval_ms);
    if wait_for_shutdown(shutdown, initial) {
        return;
    }
    loop {
        gossip_tick(core);
        if wait_for_shutdown(shutdown, interval) {
            break;
        }
    }
}

/// One gossip round: ask for addresses if short of peers, then persist the
/// candidate store.
pub(crate) fn gossip_tick(core: &NetworkCore) {
    if core.below_target() {
        let sent = core.broadcast(&ControlMessage::getaddr(), &[]);
        trace!("getaddr sent to {} peers", sent);
    }
    core.save_candidates();
}

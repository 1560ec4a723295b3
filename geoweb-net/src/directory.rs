//! Session directory for the overlay.
//!
//! The [`PeerDirectory`] is the single source of truth for "who are we
//! talking to?".  It holds three views of the live sessions plus two
//! address sets:
//!
//! | View         | Key                         | Contents                       |
//! |--------------|-----------------------------|--------------------------------|
//! | `by_address` | advertised `host:port`      | handshaked sessions            |
//! | `by_id`      | remote session id           | handshaked sessions            |
//! | `pending`    | observed `ip:port`          | sessions awaiting a handshake  |
//! | `dialing`    | resolved `ip:port`          | outbound connects in progress  |
//! | `blocked`    | `host:port` or `ip:port`    | self / duplicate addresses     |
//!
//! A session lives in `pending` until its handshake succeeds and then in
//! both `by_address` and `by_id`; a closed session is in none of them.
//! The directory is owned by one network instance and passed to whoever
//! needs it; there is no process-wide registry.

use {
    crate::session::PeerSession,
    dashmap::{mapref::entry::Entry, DashMap, DashSet},
    log::debug,
    std::sync::Arc,
};

/// Why a handshaked session could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterConflict {
    /// Another live session already carries this session id.
    DuplicateId(String),
    /// Another live session already owns this advertised address.
    DuplicateAddress(String),
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    by_address: DashMap<String, Arc<PeerSession>>,
    by_id: DashMap<String, Arc<PeerSession>>,
    pending: DashMap<String, Arc<PeerSession>>,
    dialing: DashSet<String>,
    blocked: DashSet<String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Track a freshly connected session until it handshakes.
    pub fn add_pending(&self, session: &Arc<PeerSession>) {
        self.pending
            .insert(session.effective_address(), session.clone());
    }

    /// Move a session out of the pending set.
    pub fn remove_pending(&self, session: &Arc<PeerSession>) {
        self.pending
            .remove_if(&session.effective_address(), |_, s| Arc::ptr_eq(s, session));
    }

    /// Register a handshaked session under both its advertised address and
    /// its session id.  Fails without side effects if either key is taken
    /// by a different session.
    pub fn register(
        &self,
        session: &Arc<PeerSession>,
        address: &str,
        session_id: &str,
    ) -> Result<(), RegisterConflict> {
        // lock order: by_id, then by_address
        let id_slot = match self.by_id.entry(session_id.to_string()) {
            Entry::Occupied(existing) if !Arc::ptr_eq(existing.get(), session) => {
                return Err(RegisterConflict::DuplicateId(session_id.to_string()));
            }
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot),
        };
        match self.by_address.entry(address.to_string()) {
            Entry::Occupied(existing) if !Arc::ptr_eq(existing.get(), session) => {
                return Err(RegisterConflict::DuplicateAddress(address.to_string()));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
            }
        }
        if let Some(slot) = id_slot {
            slot.insert(session.clone());
        }
        debug!("registered peer {} ({})", address, session_id);
        Ok(())
    }

    /// Drop every entry that refers to `session`.
    pub fn remove(&self, session: &Arc<PeerSession>) {
        self.remove_pending(session);
        self.by_address
            .remove_if(&session.address(), |_, s| Arc::ptr_eq(s, session));
        if let Some(id) = session.session_id() {
            self.by_id.remove_if(&id, |_, s| Arc::ptr_eq(s, session));
        }
        // the advertised address may have changed after registration
        self.by_address.retain(|_, s| !Arc::ptr_eq(s, session));
    }

    // ── Dialing ─────────────────────────────────────────────────────────

    /// Claim `address` for an outbound connect.  Returns `false` if another
    /// connect to it is already running.
    pub fn begin_dial(&self, address: &str) -> bool {
        self.dialing.insert(address.to_string())
    }

    pub fn end_dial(&self, address: &str) {
        self.dialing.remove(address);
    }

    // ── Blocking ────────────────────────────────────────────────────────

    pub fn block(&self, address: &str) {
        if self.blocked.insert(address.to_string()) {
            debug!("blocked address {}", address);
        }
    }

    pub fn is_blocked(&self, address: &str) -> bool {
        self.blocked.contains(address)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Whether a live, pending or in-progress session already covers
    /// `address`, by advertised or observed address.
    pub fn is_known(&self, address: &str) -> bool {
        self.by_address.contains_key(address)
            || self.pending.contains_key(address)
            || self.dialing.contains(address)
            || self
                .by_address
                .iter()
                .any(|entry| entry.value().effective_address() == address)
    }

    pub fn contains_id(&self, session_id: &str) -> bool {
        self.by_id.contains_key(session_id)
    }

    pub fn get(&self, address: &str) -> Option<Arc<PeerSession>> {
        self.by_address.get(address).map(|s| s.value().clone())
    }

    pub fn get_by_id(&self, session_id: &str) -> Option<Arc<PeerSession>> {
        self.by_id.get(session_id).map(|s| s.value().clone())
    }

    /// Number of handshaked sessions.
    pub fn handshaked_count(&self) -> usize {
        self.by_address.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the handshaked sessions.
    pub fn sessions(&self) -> Vec<Arc<PeerSession>> {
        self.by_address.iter().map(|s| s.value().clone()).collect()
    }

    /// Snapshot of the sessions still awaiting a handshake.
    pub fn pending_sessions(&self) -> Vec<Arc<PeerSession>> {
        self.pending.iter().map(|s| s.value().clone()).collect()
    }

    /// Every session the directory knows about, handshaked or not.
    pub fn all_sessions(&self) -> Vec<Arc<PeerSession>> {
        let mut sessions = self.sessions();
        sessions.extend(self.pending_sessions());
        sessions
    }

    /// Advertised addresses of handshaked peers, minus `excluding`.
    pub fn addresses_excluding(&self, excluding: &[Arc<PeerSession>]) -> Vec<String> {
        self.by_address
            .iter()
            .filter(|entry| !excluding.iter().any(|s| Arc::ptr_eq(s, entry.value())))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

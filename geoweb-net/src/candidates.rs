//! Tiered store of candidate peer addresses.
//!
//! Every address the node has heard of sits in exactly one of three tiers:
//!
//! | Tier      | Meaning                                     |
//! |-----------|---------------------------------------------|
//! | `Current` | handshaked with recently                    |
//! | `Recent`  | worked before, failed once since            |
//! | `Old`     | never reached, or failed repeatedly         |
//!
//! A successful handshake promotes an address to `Current`; a failed dial
//! demotes it one tier (never below `Old`).  Addresses learned through
//! gossip enter at `Old`.  The store can be loaded from and saved to a
//! [`CandidatePersistence`] backend.

use {
    crate::{
        address,
        error::Result,
    },
    log::{debug, warn},
    parking_lot::{Mutex, RwLock},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        io::ErrorKind,
        path::{Path, PathBuf},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Current = 0,
    Recent = 1,
    Old = 2,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Current, Tier::Recent, Tier::Old];

    /// The tier walked after this one, `None` after `Old`.
    pub fn next(self) -> Option<Tier> {
        match self {
            Self::Current => Some(Self::Recent),
            Self::Recent => Some(Self::Old),
            Self::Old => None,
        }
    }

    /// One tier down, saturating at `Old`.
    pub fn demoted(self) -> Tier {
        self.next().unwrap_or(Self::Old)
    }
}

/// The three address lists, in attempt order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredAddresses {
    pub current: Vec<String>,
    pub recent: Vec<String>,
    pub old: Vec<String>,
}

impl TieredAddresses {
    pub fn list(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Current => &self.current,
            Tier::Recent => &self.recent,
            Tier::Old => &self.old,
        }
    }

    fn list_mut(&mut self, tier: Tier) -> &mut Vec<String> {
        match tier {
            Tier::Current => &mut self.current,
            Tier::Recent => &mut self.recent,
            Tier::Old => &mut self.old,
        }
    }

    pub fn tier_of(&self, address: &str) -> Option<Tier> {
        Tier::ALL
            .into_iter()
            .find(|tier| self.list(*tier).iter().any(|a| a == address))
    }

    pub fn len(&self) -> usize {
        self.current
            .len()
            .saturating_add(self.recent.len())
            .saturating_add(self.old.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put `address` in `tier`, removing it from the others.
    fn place(&mut self, address: &str, tier: Tier) {
        for other in Tier::ALL {
            if other != tier {
                self.list_mut(other).retain(|a| a != address);
            }
        }
        let list = self.list_mut(tier);
        if !list.iter().any(|a| a == address) {
            list.push(address.to_string());
        }
    }
}

// ── Persistence ─────────────────────────────────────────────────────────

/// Storage backend for the candidate tiers.
pub trait CandidatePersistence: Send + Sync {
    fn load(&self) -> Result<TieredAddresses>;
    fn save(&self, addresses: &TieredAddresses) -> Result<()>;
}

/// Keeps the tiers in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    stored: Mutex<TieredAddresses>,
}

impl MemoryPersistence {
    pub fn new(initial: TieredAddresses) -> Self {
        Self {
            stored: Mutex::new(initial),
        }
    }

    pub fn stored(&self) -> TieredAddresses {
        self.stored.lock().clone()
    }
}

impl CandidatePersistence for MemoryPersistence {
    fn load(&self) -> Result<TieredAddresses> {
        Ok(self.stored.lock().clone())
    }

    fn save(&self, addresses: &TieredAddresses) -> Result<()> {
        *self.stored.lock() = addresses.clone();
        Ok(())
    }
}

/// A JSON file `{"current": [...], "recent": [...], "old": [...]}`.
/// A missing file loads as empty.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CandidatePersistence for FilePersistence {
    fn load(&self) -> Result<TieredAddresses> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TieredAddresses::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, addresses: &TieredAddresses) -> Result<()> {
        let json = serde_json::to_vec_pretty(addresses)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ── Store ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CandidateStore {
    tiers: RwLock<TieredAddresses>,
}

impl CandidateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from persisted lists.  Invalid entries are dropped; an
    /// address listed in several tiers keeps the best one.
    pub fn from_addresses(addresses: TieredAddresses) -> Self {
        let store = Self::new();
        store.merge(addresses);
        store
    }

    fn merge(&self, addresses: TieredAddresses) -> usize {
        let mut tiers = self.tiers.write();
        let mut added = 0usize;
        for tier in Tier::ALL {
            for address in addresses.list(tier) {
                if !address::is_valid_address(address) {
                    debug!("dropping invalid candidate {:?}", address);
                    continue;
                }
                if tiers.tier_of(address).is_none() {
                    tiers.list_mut(tier).push(address.clone());
                    added = added.saturating_add(1);
                }
            }
        }
        added
    }

    /// Insert `address` into `tier` unless it is already known.
    pub fn insert(&self, address: &str, tier: Tier) -> bool {
        if !address::is_valid_address(address) {
            return false;
        }
        let mut tiers = self.tiers.write();
        if tiers.tier_of(address).is_some() {
            return false;
        }
        tiers.list_mut(tier).push(address.to_string());
        true
    }

    /// Record an address heard through gossip.
    pub fn register(&self, address: &str) -> bool {
        self.insert(address, Tier::Old)
    }

    /// Move `address` to `tier`, adding it if unknown.
    pub fn set_tier(&self, address: &str, tier: Tier) -> bool {
        if !address::is_valid_address(address) {
            return false;
        }
        self.tiers.write().place(address, tier);
        true
    }

    /// The address just handshaked.
    pub fn promote(&self, address: &str) -> bool {
        self.set_tier(address, Tier::Current)
    }

    /// A dial to `address` failed: move it down one tier.  Unknown
    /// addresses are left alone.  Returns the new tier.
    pub fn demote(&self, address: &str) -> Option<Tier> {
        let mut tiers = self.tiers.write();
        let tier = tiers.tier_of(address)?;
        let demoted = tier.demoted();
        if demoted != tier {
            tiers.place(address, demoted);
        }
        Some(demoted)
    }

    pub fn tier_of(&self, address: &str) -> Option<Tier> {
        self.tiers.read().tier_of(address)
    }

    pub fn list(&self, tier: Tier) -> Vec<String> {
        self.tiers.read().list(tier).to_vec()
    }

    pub fn snapshot(&self) -> TieredAddresses {
        self.tiers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge what `persistence` holds into the store.  Returns how many
    /// addresses were new.
    pub fn load_from(&self, persistence: &dyn CandidatePersistence) -> Result<usize> {
        let loaded = persistence.load()?;
        Ok(self.merge(loaded))
    }

    pub fn save_to(&self, persistence: &dyn CandidatePersistence) -> Result<()> {
        let snapshot = self.snapshot();
        persistence.save(&snapshot).inspect_err(|e| {
            warn!("failed to save {} candidate addresses: {}", snapshot.len(), e);
        })
    }
}

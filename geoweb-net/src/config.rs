//! Configuration for the GeoWeb overlay.

use {
    crate::{address, error::ConfigError},
    std::time::Duration,
};

/// Configuration for one GeoWeb node.
///
/// Controls the listening port, network identity, liveness timing and the
/// message worker pool.  Call [`GeoWebConfig::validate`] (the network
/// builder does) before using a hand-assembled config.
#[derive(Debug, Clone)]
pub struct GeoWebConfig {
    /// TCP port to accept peers on.  `0` asks the OS for an ephemeral port.
    /// Default: `25565`
    pub listen_port: u16,

    /// Identifier of the overlay; peers with a different value are refused.
    /// Must be set to a positive value.
    pub net_id: i64,

    /// Number of handshaked peers discovery tries to maintain.
    pub peer_count_target: usize,

    /// Interval between heartbeat pings (ms).
    pub heartbeat_period_ms: u64,

    /// Time a peer has to answer a ping before it is considered dead (ms).
    pub heartbeat_timeout_ms: u64,

    /// Delay before the first heartbeat fires (ms).
    pub heartbeat_initial_delay_ms: u64,

    /// How long `send_sync_message` waits for a correlated reply (ms).
    pub sync_message_timeout_ms: u64,

    /// Maximum number of threads processing control messages.
    pub worker_pool_size: usize,

    /// How long an idle message worker lingers before exiting (ms).
    pub worker_keep_alive_ms: u64,

    /// Timeout for establishing outbound TCP connections (ms).
    pub connect_timeout_ms: u64,

    /// Hostname advertised in the handshake.  Empty means "use whatever
    /// address the peer observes".
    pub hostname: String,

    /// Whether peers may include this node in their broadcasts.
    pub accepts_broadcast: bool,

    /// Interval between `getaddr` gossip rounds (ms).
    pub gossip_interval_ms: u64,

    /// Delay before the first gossip round (ms).
    pub gossip_initial_delay_ms: u64,

    /// Pause after discovery has walked every candidate tier (ms).
    pub discovery_backoff_ms: u64,

    /// Re-check interval while discovery is idle (at target, or nothing
    /// to try) (ms).
    pub discovery_idle_poll_ms: u64,

    /// Maximum payload length accepted in a single frame.
    pub max_frame_size: usize,
}

impl Default for GeoWebConfig {
    fn default() -> Self {
        Self {
            listen_port: 25_565,
            net_id: -1,
            peer_count_target: 8,
            heartbeat_period_ms: 600_000,
            heartbeat_timeout_ms: 5_000,
            heartbeat_initial_delay_ms: 10_000,
            sync_message_timeout_ms: 60_000,
            worker_pool_size: 10,
            worker_keep_alive_ms: 60_000,
            connect_timeout_ms: 5_000,
            hostname: String::new(),
            accepts_broadcast: true,
            gossip_interval_ms: 600_000,
            gossip_initial_delay_ms: 10_000,
            discovery_backoff_ms: 600_000,
            discovery_idle_poll_ms: 1_000,
            max_frame_size: 67_108_864, // 64 MiB
        }
    }
}

impl GeoWebConfig {
    /// Default config joined to the network `net_id`.
    pub fn new(net_id: i64) -> Self {
        Self {
            net_id,
            ..Self::default()
        }
    }

    /// Create a config suitable for local testing with short timers and an
    /// ephemeral port.  Background timers are pushed far out so tests drive
    /// them explicitly.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default(net_id: i64) -> Self {
        Self {
            listen_port: 0,
            net_id,
            peer_count_target: 8,
            heartbeat_period_ms: 3_600_000,
            heartbeat_timeout_ms: 200,
            heartbeat_initial_delay_ms: 3_600_000,
            sync_message_timeout_ms: 2_000,
            worker_pool_size: 4,
            worker_keep_alive_ms: 1_000,
            connect_timeout_ms: 1_000,
            hostname: String::new(),
            accepts_broadcast: true,
            gossip_interval_ms: 3_600_000,
            gossip_initial_delay_ms: 3_600_000,
            discovery_backoff_ms: 3_600_000,
            discovery_idle_poll_ms: 50,
            max_frame_size: 1_048_576,
        }
    }

    /// Check every field against its documented bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.net_id < 1 {
            return Err(ConfigError::InvalidNetId(self.net_id));
        }
        if self.peer_count_target == 0 {
            return Err(ConfigError::InvalidPeerCountTarget);
        }
        if self.heartbeat_period_ms < 5_000 {
            return Err(ConfigError::HeartbeatPeriodTooShort(self.heartbeat_period_ms));
        }
        if self.heartbeat_timeout_ms < 100 {
            return Err(ConfigError::HeartbeatTimeoutTooShort(self.heartbeat_timeout_ms));
        }
        if self.sync_message_timeout_ms < 100 {
            return Err(ConfigError::SyncTimeoutTooShort(self.sync_message_timeout_ms));
        }
        if self.worker_pool_size == 0 {
            return Err(ConfigError::InvalidWorkerPoolSize);
        }
        if self.worker_keep_alive_ms < 1_000 {
            return Err(ConfigError::WorkerKeepAliveTooShort(self.worker_keep_alive_ms));
        }
        if self.connect_timeout_ms < 1_000 {
            return Err(ConfigError::ConnectTimeoutTooShort(self.connect_timeout_ms));
        }
        if !self.hostname.is_empty() && !address::is_valid_hostname(&self.hostname) {
            return Err(ConfigError::InvalidHostname(self.hostname.clone()));
        }
        if self.gossip_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("gossip interval"));
        }
        if self.discovery_backoff_ms == 0 {
            return Err(ConfigError::ZeroValue("discovery backoff"));
        }
        if self.discovery_idle_poll_ms == 0 {
            return Err(ConfigError::ZeroValue("discovery idle poll"));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ZeroValue("max frame size"));
        }
        Ok(())
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn sync_message_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_message_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

//! Error types for the GeoWeb overlay.

use {std::net::SocketAddr, thiserror::Error};

/// A configuration value that failed validation.
///
/// Raised by [`crate::config::GeoWebConfig::validate`]; never recoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The network identifier was not set or is not positive.
    #[error("net id must be > 0 (got {0})")]
    InvalidNetId(i64),

    /// The target number of peers must be positive.
    #[error("peer count target must be > 0")]
    InvalidPeerCountTarget,

    /// Heartbeat period below the 5000ms floor.
    #[error("heartbeat period must be >= 5000ms (got {0}ms)")]
    HeartbeatPeriodTooShort(u64),

    /// Heartbeat response window below the 100ms floor.
    #[error("heartbeat timeout must be >= 100ms (got {0}ms)")]
    HeartbeatTimeoutTooShort(u64),

    /// Sync-message response window below the 100ms floor.
    #[error("sync message timeout must be >= 100ms (got {0}ms)")]
    SyncTimeoutTooShort(u64),

    /// The worker pool needs at least one thread.
    #[error("worker pool size must be > 0")]
    InvalidWorkerPoolSize,

    /// Idle worker keep-alive below the 1000ms floor.
    #[error("worker keep-alive must be >= 1000ms (got {0}ms)")]
    WorkerKeepAliveTooShort(u64),

    /// Outbound connect timeout below the 1000ms floor.
    #[error("connect timeout must be >= 1000ms (got {0}ms)")]
    ConnectTimeoutTooShort(u64),

    /// The advertised hostname is neither empty nor a valid hostname.
    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),

    /// A scheduling interval or size limit that must be positive was zero.
    #[error("{0} must be > 0")]
    ZeroValue(&'static str),
}

/// Errors that can occur in the GeoWeb networking layer.
#[derive(Error, Debug)]
pub enum GeoWebError {
    /// Configuration rejected at construction.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A control payload could not be encoded or decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The frame type tag is neither control nor data.
    #[error("unknown frame type 0x{0:02x}")]
    UnknownFrameType(u8),

    /// A data frame arrived for a hash nobody asked for.
    #[error("unrequested data frame for hash {0}")]
    UnrequestedData(String),

    /// The string is not a valid `host:port` address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The address was blocked after a self-connection or duplicate session.
    #[error("address is blocked: {0}")]
    Blocked(String),

    /// The address points back at this node.
    #[error("refusing to connect to self: {0}")]
    SelfConnection(String),

    /// A session to the address already exists or is being set up.
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// Connection to a peer was refused or timed out.
    #[error("connection failed to {0}: {1}")]
    ConnectionFailed(SocketAddr, String),

    /// A caller-supplied message uses a field the protocol reserves.
    #[error("message uses reserved field {0:?}")]
    ReservedField(&'static str),

    /// A `hash` field that is not 64 hex characters.
    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    /// Data handed to an upload does not hash to the requested value.
    #[error("data does not match requested hash {0}")]
    HashMismatch(String),

    /// The session was closed before the operation completed.
    #[error("peer session closed")]
    SessionClosed,

    /// The listening port could not be bound.
    #[error("port {0} is unavailable: {1}")]
    PortUnavailable(u16, std::io::Error),

    /// The network has been shut down.
    #[error("network is shut down")]
    Shutdown,
}

/// Convenience result type for GeoWeb operations.
pub type Result<T> = std::result::Result<T, GeoWebError>;

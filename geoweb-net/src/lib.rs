//! GeoWeb peer-to-peer overlay networking.
//!
//! This crate maintains a mesh of TCP connections between nodes that share
//! a network id and gives applications a small set of primitives on top:
//!
//! - **Framed protocol**: JSON control messages and content-addressed
//!   binary payloads share one `[type][length][payload]` framing.
//! - **Handshake and liveness**: every session handshakes once (network
//!   id, session id, advertised address) and is evicted by a two-phase
//!   ping/sweep heartbeat when it stops answering.
//! - **Peer discovery**: a tiered candidate store (`current` / `recent` /
//!   `old`) is walked until the target peer count is reached, and peers
//!   gossip addresses with `getaddr` / `addr`.
//! - **Messaging**: broadcast, fire-and-forget sends, synchronous
//!   request/response correlated by `reqUid` / `respUid`, and SHA-256
//!   verified data transfers.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  Application                                               │
//!  │  MessageHandler (control messages) · EventHandlers (events)│
//!  └─────────────▲───────────────────────────────▲──────────────┘
//!                │ on_message                    │ events thread
//!  ┌─────────────┴──────────────┐   ┌────────────┴──────────────┐
//!  │ Dispatcher (worker pool)   │──▶│ EventSink                 │
//!  │ handshake · getaddr · addr │   └───────────────────────────┘
//!  │ ping/pong · requestData    │
//!  └─────────────▲──────────────┘
//!                │ control payloads
//!  ┌─────────────┴──────────────┐   ┌───────────────────────────┐
//!  │ PeerSession (1 per socket) │◀─▶│ PeerDirectory             │
//!  │ Connection read loop       │   │ by address · by id ·      │
//!  │ sync requests · transfers  │   │ pending · blocked         │
//!  └─────────────▲──────────────┘   └─────────────▲─────────────┘
//!                │                                │
//!  ┌─────────────┴────────────────────────────────┴─────────────┐
//!  │ Network: acceptor · discovery · gossip · heartbeat threads │
//!  │ CandidateStore (current / recent / old)                    │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]       | `GeoWebConfig` defaults, validation and dev overrides |
//! | [`error`]        | Crate-wide error enums |
//! | [`address`]      | `host:port` syntax |
//! | [`message`]      | Control messages, response codes, frame codec |
//! | [`connection`]   | Socket send path and frame read loop |
//! | [`transfer`]     | Content hashes and download state |
//! | [`session`]      | Per-peer state machine and request registries |
//! | [`directory`]    | Live session lookup and blocked addresses |
//! | [`dispatcher`]   | Built-in command handling |
//! | [`events`]       | Lifecycle events and their delivery thread |
//! | [`candidates`]   | Tiered candidate addresses and persistence |
//! | [`discovery`]    | Outbound dialing and address gossip |
//! | [`heartbeat`]    | Ping / sweep liveness schedule |
//! | [`worker_pool`]  | Bounded message-processing threads |
//! | [`network`]      | The orchestrator tying it together |

pub mod address;
pub mod candidates;
pub mod config;
pub mod connection;
pub mod directory;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod message;
pub mod network;
pub mod session;
pub mod transfer;
pub mod worker_pool;

pub use {
    candidates::{
        CandidatePersistence, CandidateStore, FilePersistence, MemoryPersistence, Tier,
        TieredAddresses,
    },
    config::GeoWebConfig,
    dispatcher::{MessageHandler, NoopHandler},
    error::{ConfigError, GeoWebError, Result},
    events::{DataRequest, EventHandlers, EventSink, NetworkEvent},
    heartbeat::HeartbeatPhase,
    message::{Command, ControlMessage, ResponseCode},
    network::{Network, NetworkBuilder},
    session::{PeerSession, SessionState, SyncResponse},
    transfer::{ContentHash, DataTransfer, TransferListener, TransferStatus},
};

//! Control messages and the frame codec.
//!
//! Control messages are loosely-typed JSON objects: a mandatory `command`
//! string plus whatever fields that command uses.  The [`ControlMessage`]
//! wrapper keeps the untyped map (applications may add their own commands
//! and fields) and offers typed accessors for the protocol fields.
//!
//! ## Wire format
//!
//! Every frame on a connection is type-tagged and length-prefixed:
//!
//! ```text
//! [1 byte: type][4 bytes: length (u32-be)][payload]
//!
//! type 0x05  control   payload = UTF-8 JSON object, length = payload bytes
//! type 0x02  data      payload = [32-byte hash][data], length = data bytes
//! ```
//!
//! Note the asymmetry: the length of a data frame does NOT count the
//! 32-byte hash that precedes the data.

use {
    crate::{
        error::{GeoWebError, Result},
        transfer::ContentHash,
    },
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    std::io::Read,
};

/// Type tag of a control frame.
pub const CONTROL_FRAME: u8 = 0x05;
/// Type tag of a data frame.
pub const DATA_FRAME: u8 = 0x02;
/// Size of the `[type][length]` frame header.
pub const FRAME_HEADER_LEN: usize = 5;
/// Size of the content hash leading a data frame payload.
pub const HASH_LEN: usize = 32;

/// Protocol field names.
pub mod fields {
    pub const COMMAND: &str = "command";
    pub const NET_ID: &str = "netId";
    pub const ID: &str = "id";
    pub const HOSTNAME: &str = "hostname";
    pub const PORT: &str = "port";
    pub const ACCEPTS_BROADCAST: &str = "acceptsBroadcast";
    pub const REQ_UID: &str = "reqUid";
    pub const RESP_UID: &str = "respUid";
    pub const REQ_RESP_CODE: &str = "reqRespCode";
    pub const SHARE: &str = "share";
    pub const ADDRESSES: &str = "addresses";
    pub const HASH: &str = "hash";
    pub const VALUE: &str = "value";
}

// ── Commands ────────────────────────────────────────────────────────────────

/// Commands with built-in protocol handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Handshake,
    GetAddr,
    Addr,
    Ping,
    Pong,
    AcceptBroadcast,
    RequestData,
}

impl Command {
    /// The wire spelling of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::GetAddr => "getaddr",
            Self::Addr => "addr",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::AcceptBroadcast => "acceptBroadcast",
            Self::RequestData => "requestData",
        }
    }

    /// Map a wire command to a built-in, `None` for application commands.
    pub fn parse(command: &str) -> Option<Self> {
        Some(match command {
            "handshake" => Self::Handshake,
            "getaddr" => Self::GetAddr,
            "addr" => Self::Addr,
            "ping" => Self::Ping,
            "pong" => Self::Pong,
            "acceptBroadcast" => Self::AcceptBroadcast,
            "requestData" => Self::RequestData,
            _ => return None,
        })
    }
}

// ── Response codes ──────────────────────────────────────────────────────────

/// Status attached to replies of synchronous requests (`reqRespCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Ok,
    Accepted,
    BadRequest,
    NotFound,
    RequestTimeout,
    Error,
    Unknown,
}

impl ResponseCode {
    pub fn code(&self) -> i64 {
        match self {
            Self::Ok => 200,
            Self::Accepted => 202,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::RequestTimeout => 408,
            Self::Error => 500,
            Self::Unknown => 0,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            200 => Self::Ok,
            202 => Self::Accepted,
            400 => Self::BadRequest,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            500 => Self::Error,
            _ => Self::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Accepted => "Accepted",
            Self::BadRequest => "Bad request",
            Self::NotFound => "Not found",
            Self::RequestTimeout => "Request timeout",
            Self::Error => "Error",
            Self::Unknown => "Unknown code",
        }
    }
}

// ── Control message ─────────────────────────────────────────────────────────

/// An untyped control message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlMessage(Map<String, Value>);

impl ControlMessage {
    /// A message carrying only `command`.
    pub fn new(command: &str) -> Self {
        let mut map = Map::new();
        map.insert(fields::COMMAND.to_string(), Value::from(command));
        Self(map)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.0.get(key).and_then(Value::as_array)
    }

    /// The `command` field, if present and a string.
    pub fn command(&self) -> Option<&str> {
        self.get_str(fields::COMMAND)
    }

    /// The built-in command this message carries, if any.
    pub fn builtin_command(&self) -> Option<Command> {
        self.command().and_then(Command::parse)
    }

    /// Borrow the underlying JSON map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Encode as a compact UTF-8 JSON object.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.0).map_err(GeoWebError::Json)
    }

    /// Decode a JSON object.  Anything that is not an object is an error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(GeoWebError::Json)
    }

    // ── Protocol constructors ───────────────────────────────────────────

    /// The handshake every session sends exactly once.
    pub fn handshake(
        net_id: i64,
        session_id: &str,
        hostname: &str,
        port: u16,
        accepts_broadcast: bool,
    ) -> Self {
        let mut msg = Self::new(Command::Handshake.as_str())
            .with(fields::NET_ID, net_id)
            .with(fields::ID, session_id)
            .with(fields::PORT, port);
        if !hostname.is_empty() {
            msg.set(fields::HOSTNAME, hostname);
        }
        if !accepts_broadcast {
            msg.set(fields::ACCEPTS_BROADCAST, false);
        }
        msg
    }

    pub fn ping() -> Self {
        Self::new(Command::Ping.as_str())
    }

    pub fn pong() -> Self {
        Self::new(Command::Pong.as_str())
    }

    pub fn getaddr() -> Self {
        Self::new(Command::GetAddr.as_str())
    }

    /// An address list; `share` asks the receiver to relay it one hop.
    pub fn addr(addresses: &[String], share: bool) -> Self {
        let mut msg = Self::new(Command::Addr.as_str()).with(fields::ADDRESSES, addresses.to_vec());
        if share {
            msg.set(fields::SHARE, true);
        }
        msg
    }

    pub fn accept_broadcast(value: bool) -> Self {
        Self::new(Command::AcceptBroadcast.as_str()).with(fields::VALUE, value)
    }

    pub fn request_data(hash: &ContentHash) -> Self {
        Self::new(Command::RequestData.as_str()).with(fields::HASH, hash.to_hex())
    }
}

// ── Frames ──────────────────────────────────────────────────────────────────

/// Decoded `[type][length]` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    /// A control frame with `len` payload bytes.
    Control { len: usize },
    /// A data frame with `len` data bytes (hash not included).
    Data { len: usize },
}

impl FrameHeader {
    /// Parse a header, rejecting unknown tags and lengths above `max_size`.
    pub fn parse(header: &[u8; FRAME_HEADER_LEN], max_size: usize) -> Result<Self> {
        let [tag, len @ ..] = *header;
        let len = u32::from_be_bytes(len) as usize;
        if len > max_size {
            return Err(GeoWebError::FrameTooLarge {
                size: len,
                max: max_size,
            });
        }
        match tag {
            CONTROL_FRAME => Ok(Self::Control { len }),
            DATA_FRAME => Ok(Self::Data { len }),
            other => Err(GeoWebError::UnknownFrameType(other)),
        }
    }

    /// Read and parse a header from a blocking stream.
    pub fn read_from(reader: &mut impl Read, max_size: usize) -> Result<Self> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header)?;
        Self::parse(&header, max_size)
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlMessage),
    Data { hash: ContentHash, data: Vec<u8> },
}

impl Frame {
    /// Serialize the frame, header included.
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>> {
        match self {
            Self::Control(message) => encode_control_frame(message, max_size),
            Self::Data { hash, data } => encode_data_frame(hash, data, max_size),
        }
    }

    /// Decode one frame from the front of `bytes`, returning it with the
    /// number of bytes consumed.
    pub fn decode(bytes: &[u8], max_size: usize) -> Result<(Self, usize)> {
        let mut reader = bytes;
        let frame = Self::read_from(&mut reader, max_size)?;
        let consumed = bytes.len().saturating_sub(reader.len());
        Ok((frame, consumed))
    }

    /// Read exactly one frame from a blocking stream.
    pub fn read_from(reader: &mut impl Read, max_size: usize) -> Result<Self> {
        match FrameHeader::read_from(reader, max_size)? {
            FrameHeader::Control { len } => {
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload)?;
                Ok(Self::Control(ControlMessage::from_bytes(&payload)?))
            }
            FrameHeader::Data { len } => {
                let mut hash = [0u8; HASH_LEN];
                reader.read_exact(&mut hash)?;
                let mut data = vec![0u8; len];
                reader.read_exact(&mut data)?;
                Ok(Self::Data {
                    hash: ContentHash::new(hash),
                    data,
                })
            }
        }
    }
}

/// Encode `message` as a control frame.
pub fn encode_control_frame(message: &ControlMessage, max_size: usize) -> Result<Vec<u8>> {
    let payload = message.to_bytes()?;
    let mut buf = frame_buffer(CONTROL_FRAME, payload.len(), 0, max_size)?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Encode `data` as a data frame.  The length field counts `data` only.
pub fn encode_data_frame(hash: &ContentHash, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let mut buf = frame_buffer(DATA_FRAME, data.len(), HASH_LEN, max_size)?;
    buf.extend_from_slice(hash.as_bytes());
    buf.extend_from_slice(data);
    Ok(buf)
}

/// Allocate a buffer for a frame and write its header.
fn frame_buffer(tag: u8, len: usize, extra: usize, max_size: usize) -> Result<Vec<u8>> {
    if len > max_size {
        return Err(GeoWebError::FrameTooLarge {
            size: len,
            max: max_size,
        });
    }
    let wire_len = u32::try_from(len).map_err(|_| GeoWebError::FrameTooLarge {
        size: len,
        max: u32::MAX as usize,
    })?;
    let capacity = FRAME_HEADER_LEN.saturating_add(extra).saturating_add(len);
    let mut buf = Vec::with_capacity(capacity);
    buf.push(tag);
    buf.extend_from_slice(&wire_len.to_be_bytes());
    Ok(buf)
}

// ── Tests ───────────────────────────────────────────────────────────────────

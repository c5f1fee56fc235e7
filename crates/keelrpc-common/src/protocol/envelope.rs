//! The unit exchanged over a connection.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use super::error::{Result, RpcError};
use super::requests::RpcRequest;
use super::responses::RpcResponse;

static SEQUENCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Frame kind, written as one byte after the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    HeartbeatPing = 3,
    HeartbeatPong = 4,
}

impl MessageType {
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageType::HeartbeatPing | MessageType::HeartbeatPong)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = RpcError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::HeartbeatPing),
            4 => Ok(MessageType::HeartbeatPong),
            other => Err(RpcError::Framing(format!("unknown message type {}", other))),
        }
    }
}

/// Serializer selected by the `codecId` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SerializationKind {
    #[default]
    Json,
    Cbor,
}

impl SerializationKind {
    pub const ALL: [SerializationKind; 2] = [SerializationKind::Json, SerializationKind::Cbor];

    pub fn id(self) -> u8 {
        match self {
            SerializationKind::Json => 1,
            SerializationKind::Cbor => 2,
        }
    }

    /// Name under which the implementation is registered.
    pub fn name(self) -> &'static str {
        match self {
            SerializationKind::Json => "json",
            SerializationKind::Cbor => "cbor",
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or_else(|| RpcError::Configuration(format!("no serializer registered for codec id {}", id)))
    }
}

impl FromStr for SerializationKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| RpcError::Configuration(format!("unknown serializer '{}'", s)))
    }
}

impl fmt::Display for SerializationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compressor selected by the `compressId` header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionKind {
    None,
    #[default]
    Deflate,
}

impl CompressionKind {
    pub const ALL: [CompressionKind; 2] = [CompressionKind::None, CompressionKind::Deflate];

    pub fn id(self) -> u8 {
        match self {
            CompressionKind::None => 0,
            CompressionKind::Deflate => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::None => "none",
            CompressionKind::Deflate => "deflate",
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.id() == id)
            .ok_or_else(|| RpcError::Configuration(format!("no compressor registered for compress id {}", id)))
    }
}

impl FromStr for CompressionKind {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| RpcError::Configuration(format!("unknown compressor '{}'", s)))
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Decoded frame body. Heartbeats carry no body on the wire and decode to
/// the `Ping`/`Pong` sentinels.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Request(RpcRequest),
    Response(RpcResponse),
    Ping,
    Pong,
}

impl Payload {
    pub fn message_type(&self) -> MessageType {
        match self {
            Payload::Request(_) => MessageType::Request,
            Payload::Response(_) => MessageType::Response,
            Payload::Ping => MessageType::HeartbeatPing,
            Payload::Pong => MessageType::HeartbeatPong,
        }
    }
}

/// A framed message: header fields plus payload.
///
/// `sequence` is stamped from a per-process counter when the envelope is
/// built. It only shows up in logs; responses are matched to requests by
/// `request_id` inside the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub codec: SerializationKind,
    pub compress: CompressionKind,
    pub sequence: u32,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(codec: SerializationKind, compress: CompressionKind, payload: Payload) -> Self {
        Envelope {
            codec,
            compress,
            sequence: next_sequence(),
            payload,
        }
    }

    pub fn request(codec: SerializationKind, compress: CompressionKind, request: RpcRequest) -> Self {
        Self::new(codec, compress, Payload::Request(request))
    }

    pub fn response(codec: SerializationKind, compress: CompressionKind, response: RpcResponse) -> Self {
        Self::new(codec, compress, Payload::Response(response))
    }

    pub fn ping(codec: SerializationKind, compress: CompressionKind) -> Self {
        Self::new(codec, compress, Payload::Ping)
    }

    pub fn pong(codec: SerializationKind, compress: CompressionKind) -> Self {
        Self::new(codec, compress, Payload::Pong)
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }
}

fn next_sequence() -> u32 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::compress::{builtin_compressors, Compressor};
use crate::extension::ExtensionLoader;
use crate::protocol::error::{Result, RpcError};
use crate::protocol::{CompressionKind, Envelope, MessageType, Payload, SerializationKind};
use crate::serialize::{builtin_serializers, Serializer};

/// Frame magic, first four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"krpc";
pub const VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = 16;
/// Largest frame (header included) the codec will read or write.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

const LENGTH_OFFSET: usize = 5;

/// Binary frame codec.
///
/// # Wire Format
///
/// ```text
/// magic(4) | version(1) | full_length(4) | type(1) | codec(1) | compress(1) | sequence(4) | body
/// ```
///
/// `full_length` counts the whole frame including the 16-byte header. All
/// integers are big-endian. Heartbeat frames have no body.
///
/// The codec resolves the serializer and compressor for each frame by the
/// ids in its header, through the shared [`ExtensionLoader`]s.
///
/// # Example
///
/// ```
/// use bytes::BytesMut;
/// use keelrpc_common::transport::RpcCodec;
/// use keelrpc_common::{CompressionKind, Envelope, SerializationKind};
///
/// let codec = RpcCodec::new();
/// let ping = Envelope::ping(SerializationKind::Json, CompressionKind::None);
///
/// let mut buf = BytesMut::new();
/// codec.encode(&ping, &mut buf).unwrap();
/// assert_eq!(buf.len(), 16);
///
/// let decoded = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(decoded, ping);
/// assert!(buf.is_empty());
/// ```
#[derive(Clone)]
pub struct RpcCodec {
    serializers: Arc<ExtensionLoader<dyn Serializer>>,
    compressors: Arc<ExtensionLoader<dyn Compressor>>,
    max_frame_length: usize,
}

impl RpcCodec {
    /// Creates a codec over the built-in serializers and compressors.
    pub fn new() -> Self {
        Self::with_loaders(
            Arc::new(builtin_serializers()),
            Arc::new(builtin_compressors()),
        )
    }

    pub fn with_loaders(
        serializers: Arc<ExtensionLoader<dyn Serializer>>,
        compressors: Arc<ExtensionLoader<dyn Compressor>>,
    ) -> Self {
        RpcCodec {
            serializers,
            compressors,
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length.max(HEADER_LENGTH);
        self
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn serializer(&self, kind: SerializationKind) -> Result<Arc<dyn Serializer>> {
        self.serializers.get_extension(kind.name())
    }

    pub fn compressor(&self, kind: CompressionKind) -> Result<Arc<dyn Compressor>> {
        self.compressors.get_extension(kind.name())
    }

    /// Appends one frame to `dst`.
    ///
    /// The length field is written as a placeholder and patched once the
    /// body size is known. On error `dst` is left as it was.
    pub fn encode(&self, envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
        let body = self.encode_body(envelope)?;
        let full_length = HEADER_LENGTH + body.len();
        if full_length > self.max_frame_length {
            return Err(RpcError::Framing(format!(
                "frame of {} bytes exceeds limit of {} bytes",
                full_length, self.max_frame_length
            )));
        }

        let start = dst.len();
        dst.reserve(full_length);
        dst.put_slice(&MAGIC);
        dst.put_u8(VERSION);
        dst.put_u32(0);
        dst.put_u8(envelope.message_type() as u8);
        dst.put_u8(envelope.codec.id());
        dst.put_u8(envelope.compress.id());
        dst.put_u32(envelope.sequence);
        dst.put_slice(&body);

        let written = (dst.len() - start) as u32;
        let length_at = start + LENGTH_OFFSET;
        dst[length_at..length_at + 4].copy_from_slice(&written.to_be_bytes());
        Ok(())
    }

    fn encode_body(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let serialized = match &envelope.payload {
            Payload::Ping | Payload::Pong => return Ok(Vec::new()),
            Payload::Request(request) => self.serializer(envelope.codec)?.serialize_request(request)?,
            Payload::Response(response) => self.serializer(envelope.codec)?.serialize_response(response)?,
        };
        self.compressor(envelope.compress)?.compress(&serialized)
    }

    /// Decodes one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` holds less
    /// than a full frame. Magic and version are checked as soon as their
    /// bytes arrive, so garbage is rejected before a whole frame is
    /// buffered.
    ///
    /// # Errors
    ///
    /// - `Framing` for a bad magic, version, length or message type. The
    ///   stream cannot be resynchronized after this.
    /// - `Configuration` for a codec or compress id with no implementation.
    /// - `Serialization` if the body does not decompress or deserialize.
    ///   The frame has been consumed in that case.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let magic_len = src.len().min(MAGIC.len());
        if src[..magic_len] != MAGIC[..magic_len] {
            return Err(RpcError::Framing(format!(
                "unknown magic {:02x?}",
                &src[..magic_len]
            )));
        }
        if src.len() > MAGIC.len() && src[MAGIC.len()] != VERSION {
            return Err(RpcError::Framing(format!(
                "unsupported version {} (expected {})",
                src[MAGIC.len()],
                VERSION
            )));
        }
        if src.len() < LENGTH_OFFSET + 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[LENGTH_OFFSET..LENGTH_OFFSET + 4]);
        let full_length = u32::from_be_bytes(length_bytes) as usize;
        if full_length < HEADER_LENGTH {
            return Err(RpcError::Framing(format!(
                "declared frame length {} is shorter than the header",
                full_length
            )));
        }
        if full_length > self.max_frame_length {
            return Err(RpcError::Framing(format!(
                "declared frame length {} exceeds limit of {} bytes",
                full_length, self.max_frame_length
            )));
        }
        if src.len() < full_length {
            return Ok(None);
        }

        let mut frame = src.split_to(full_length);
        frame.advance(LENGTH_OFFSET + 4);
        let message_type = MessageType::try_from(frame.get_u8())?;
        let codec_id = frame.get_u8();
        let compress_id = frame.get_u8();
        let sequence = frame.get_u32();
        let codec = SerializationKind::from_id(codec_id)?;
        let compress = CompressionKind::from_id(compress_id)?;

        let payload = match message_type {
            MessageType::HeartbeatPing => Payload::Ping,
            MessageType::HeartbeatPong => Payload::Pong,
            MessageType::Request | MessageType::Response => {
                let body = self.compressor(compress)?.decompress(&frame)?;
                let serializer = self.serializer(codec)?;
                if message_type == MessageType::Request {
                    Payload::Request(serializer.deserialize_request(&body)?)
                } else {
                    Payload::Response(serializer.deserialize_response(&body)?)
                }
            }
        };

        if message_type.is_heartbeat() && !frame.is_empty() {
            warn!(sequence, extra = frame.len(), "ignoring body on heartbeat frame");
        }
        debug!(sequence, ?message_type, full_length, "decoded frame");

        Ok(Some(Envelope {
            codec,
            compress,
            sequence,
            payload,
        }))
    }
}

impl Default for RpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RpcCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCodec")
            .field("serializers", &self.serializers)
            .field("compressors", &self.compressors)
            .field("max_frame_length", &self.max_frame_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcRequest, RpcResponse, ServiceIdentity};
    use serde_json::json;

    fn echo_request() -> RpcRequest {
        RpcRequest::new(&ServiceIdentity::new("Echo").with_group("g1").with_version("v1"), "echo")
            .with_arg("String", json!("hi"))
    }

    fn encode(codec: &RpcCodec, envelope: &Envelope) -> BytesMut {
        let mut buf = BytesMut::new();
        codec.encode(envelope, &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_header_layout() {
        let codec = RpcCodec::new();
        let mut envelope = Envelope::request(SerializationKind::Json, CompressionKind::None, echo_request());
        envelope.sequence = 0x01020304;
        let buf = encode(&codec, &envelope);

        assert_eq!(&buf[0..4], b"krpc");
        assert_eq!(buf[4], VERSION);
        assert_eq!(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize, buf.len());
        assert_eq!(buf[9], MessageType::Request as u8);
        assert_eq!(buf[10], 1);
        assert_eq!(buf[11], 0);
        assert_eq!(&buf[12..16], &[1, 2, 3, 4]);

        let body: RpcRequest = serde_json::from_slice(&buf[16..]).unwrap();
        assert_eq!(body, echo_request_with_id(&envelope));
    }

    fn echo_request_with_id(envelope: &Envelope) -> RpcRequest {
        match &envelope.payload {
            Payload::Request(r) => r.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_every_codec_and_compressor_combination() {
        let codec = RpcCodec::new();
        for ser in SerializationKind::ALL {
            for comp in CompressionKind::ALL {
                let envelopes = [
                    Envelope::request(ser, comp, echo_request()),
                    Envelope::response(ser, comp, RpcResponse::success("r1".into(), json!({"n": [1, 2]}))),
                    Envelope::response(ser, comp, RpcResponse::success("r3".into(), serde_json::Value::Null)),
                    Envelope::response(ser, comp, RpcResponse::fail("r2".into(), "boom")),
                    Envelope::ping(ser, comp),
                    Envelope::pong(ser, comp),
                ];
                for envelope in envelopes {
                    let mut buf = encode(&codec, &envelope);
                    let decoded = codec.decode(&mut buf).unwrap().unwrap();
                    assert_eq!(decoded, envelope, "{} / {}", ser, comp);
                    assert!(buf.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_heartbeat_has_no_body() {
        let codec = RpcCodec::new();
        let buf = encode(&codec, &Envelope::pong(SerializationKind::Cbor, CompressionKind::Deflate));
        assert_eq!(buf.len(), HEADER_LENGTH);
        assert_eq!(buf[9], MessageType::HeartbeatPong as u8);
    }

    #[test]
    fn test_partial_frame_is_not_consumed() {
        let codec = RpcCodec::new();
        let full = encode(&codec, &Envelope::request(SerializationKind::Json, CompressionKind::Deflate, echo_request()));

        for cut in [0, 3, 4, 8, 9, HEADER_LENGTH, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(codec.decode(&mut partial).unwrap().is_none(), "cut at {}", cut);
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let codec = RpcCodec::new();
        let first = Envelope::ping(SerializationKind::Json, CompressionKind::None);
        let second = Envelope::request(SerializationKind::Cbor, CompressionKind::Deflate, echo_request());
        let mut buf = encode(&codec, &first);
        codec.encode(&second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bad_magic_is_framing_error() {
        let codec = RpcCodec::new();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(RpcError::Framing(_))));

        let mut short = BytesMut::from(&b"kx"[..]);
        assert!(matches!(codec.decode(&mut short), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_bad_version_is_framing_error() {
        let codec = RpcCodec::new();
        let mut buf = encode(&codec, &Envelope::ping(SerializationKind::Json, CompressionKind::None));
        buf[4] = VERSION + 1;
        match codec.decode(&mut buf) {
            Err(RpcError::Framing(msg)) => assert!(msg.contains("version")),
            other => panic!("expected framing error, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_length_out_of_bounds() {
        let codec = RpcCodec::new().with_max_frame_length(1024);
        let mut buf = encode(&codec, &Envelope::ping(SerializationKind::Json, CompressionKind::None));

        buf[5..9].copy_from_slice(&8u32.to_be_bytes());
        assert!(matches!(codec.decode(&mut buf.clone()), Err(RpcError::Framing(_))));

        buf[5..9].copy_from_slice(&4096u32.to_be_bytes());
        assert!(matches!(codec.decode(&mut buf), Err(RpcError::Framing(_))));
    }

    #[test]
    fn test_oversized_encode_is_rejected() {
        let codec = RpcCodec::new().with_max_frame_length(64);
        let big = RpcRequest::new(&ServiceIdentity::new("Echo"), "echo")
            .with_arg("String", json!("x".repeat(512)));
        let mut buf = BytesMut::from(&b"keep"[..]);
        let result = codec.encode(&Envelope::request(SerializationKind::Json, CompressionKind::None, big), &mut buf);
        assert!(matches!(result, Err(RpcError::Framing(_))));
        assert_eq!(&buf[..], b"keep");
    }

    #[test]
    fn test_unknown_message_type_and_codec_id() {
        let codec = RpcCodec::new();
        let ping = encode(&codec, &Envelope::ping(SerializationKind::Json, CompressionKind::None));

        let mut bad_type = ping.clone();
        bad_type[9] = 42;
        assert!(matches!(codec.decode(&mut bad_type), Err(RpcError::Framing(_))));

        let mut bad_codec = ping.clone();
        bad_codec[10] = 9;
        assert!(matches!(codec.decode(&mut bad_codec), Err(RpcError::Configuration(_))));
    }

    #[test]
    fn test_corrupt_body_consumes_frame() {
        let codec = RpcCodec::new();
        let mut buf = encode(&codec, &Envelope::request(SerializationKind::Json, CompressionKind::None, echo_request()));
        let len = buf.len();
        buf[len - 1] = b'!';
        codec
            .encode(&Envelope::ping(SerializationKind::Json, CompressionKind::None), &mut buf)
            .unwrap();

        assert!(matches!(codec.decode(&mut buf), Err(RpcError::Serialization(_))));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().payload, Payload::Ping);
    }
}

//! Byte-stream framing shared by client and server.
//!
//! Connections are plain async byte streams; [`RpcCodec`] turns the bytes
//! into [`Envelope`](crate::Envelope)s and back. The stream is read into a
//! `BytesMut` and `decode` is called until it returns `None`, so partial
//! reads are handled by simply waiting for more bytes.

pub mod codec;

pub use codec::{RpcCodec, HEADER_LENGTH, MAGIC, MAX_FRAME_LENGTH, VERSION};

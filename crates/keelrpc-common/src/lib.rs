//! keelrpc Common Types and Wire Codec
//!
//! This crate provides the protocol definitions, the binary frame codec and
//! the pluggable-component machinery shared by every keelrpc crate.
//!
//! # Overview
//!
//! - **Protocol Layer**: [`RpcRequest`], [`RpcResponse`], [`Envelope`],
//!   routing keys ([`ServiceIdentity`], [`Endpoint`]) and the [`RpcError`]
//!   taxonomy
//! - **Transport Layer**: [`transport::RpcCodec`], the 16-byte-header frame
//!   codec
//! - **Extensions**: [`extension::ExtensionLoader`] plus the built-in
//!   [`serialize`] and [`compress`] strategies it hands out
//!
//! # Wire Format
//!
//! ```text
//! magic "krpc" | version 1 | full_length u32 | type | codec | compress | sequence u32 | body
//! ```
//!
//! The body is the serialized request or response after compression.
//! Heartbeat frames carry no body.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use keelrpc_common::transport::RpcCodec;
//! use keelrpc_common::{CompressionKind, Envelope, Payload, RpcRequest, SerializationKind, ServiceIdentity};
//! use serde_json::json;
//!
//! let identity: ServiceIdentity = "Echo::demo::1".parse().unwrap();
//! let request = RpcRequest::new(&identity, "echo").with_arg("String", json!("hi"));
//! let envelope = Envelope::request(SerializationKind::Cbor, CompressionKind::Deflate, request.clone());
//!
//! let codec = RpcCodec::new();
//! let mut wire = BytesMut::new();
//! codec.encode(&envelope, &mut wire).unwrap();
//!
//! let decoded = codec.decode(&mut wire).unwrap().unwrap();
//! assert_eq!(decoded.payload, Payload::Request(request));
//! ```

pub mod compress;
pub mod extension;
pub mod protocol;
pub mod serialize;
pub mod transport;

pub use protocol::*;

//! keelrpc caller side.
//!
//! - [`RpcClient`]: discovery + load balancing + connection reuse + correlation
//! - [`ServiceProxy`]: per-service call handle built with [`RpcClient::proxy`]
//! - [`ConnectionManager`] / [`Connection`]: one multiplexed, heartbeated
//!   connection per endpoint
//! - [`PendingRequests`]: request id to response handle table

pub mod client;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod manager;
pub mod pending;
pub mod proxy;

pub use client::{RpcClient, RpcRequestTransport};
pub use config::ClientConfig;
pub use connection::Connection;
pub use dialer::{builtin_dialers, AsyncStream, BoxedStream, Dialer, TcpDialer};
pub use manager::ConnectionManager;
pub use pending::{PendingRequests, ResponseHandle};
pub use proxy::ServiceProxy;

//! How the client opens byte streams to endpoints.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use keelrpc_common::extension::ExtensionLoader;
use keelrpc_common::{Endpoint, Result, RpcError};

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedStream>;
}

/// Plain TCP with Nagle disabled.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BoxedStream> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to connect to {}: {}", endpoint, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Connection(format!("Failed to set TCP_NODELAY: {}", e)))?;
        debug!(%endpoint, "tcp stream opened");
        Ok(Box::new(stream))
    }
}

/// Loader holding the built-in transports. Only `tcp` ships.
pub fn builtin_dialers() -> ExtensionLoader<dyn Dialer> {
    ExtensionLoader::<dyn Dialer>::new("transport")
        .register("tcp", || Ok(Arc::new(TcpDialer) as Arc<dyn Dialer>))
}

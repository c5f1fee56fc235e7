use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use keelrpc_common::transport::RpcCodec;
use keelrpc_common::{Endpoint, Result, RpcError, RpcRequest, ServiceIdentity};
use keelrpc_registry::{builtin_load_balancers, LoadBalance, ServiceDirectory};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::dialer::{builtin_dialers, Dialer};
use crate::manager::ConnectionManager;
use crate::pending::{PendingRequests, ResponseHandle};
use crate::proxy::ServiceProxy;

/// What a proxy needs from a transport: send a request and hand back
/// something to await.
#[async_trait]
pub trait RpcRequestTransport: Send + Sync {
    /// Sends `request` and returns its pending handle without waiting for
    /// the response.
    async fn send_request(&self, request: RpcRequest) -> Result<ResponseHandle>;

    /// Sends `request` and waits for its result value.
    async fn call(&self, request: RpcRequest) -> Result<Value>;
}

struct ClientInner {
    config: ClientConfig,
    directory: Arc<ServiceDirectory>,
    load_balancer: Arc<dyn LoadBalance>,
    dialer: Arc<dyn Dialer>,
    connections: ConnectionManager,
    pending: Arc<PendingRequests>,
    codec: RpcCodec,
}

/// keelrpc client.
///
/// Routes each request through the directory and load balancer, reuses
/// one connection per endpoint, and correlates responses by request id.
/// Cloning is cheap; clones share connections and pending state.
///
/// # Example
///
/// ```rust,no_run
/// use keelrpc_client::{ClientConfig, RpcClient};
/// use keelrpc_registry::{MemoryStore, ServiceDirectory};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> keelrpc_common::Result<()> {
/// let directory = Arc::new(ServiceDirectory::new(Arc::new(MemoryStore::new())));
/// let client = RpcClient::new(ClientConfig::default(), directory)?;
///
/// let echo = client.proxy("Echo::demo::1".parse()?);
/// let reply = echo.call("echo", vec!["String".into()], vec![json!("hi")]).await?;
/// assert_eq!(reply, json!("hi"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Creates a client, resolving the load balancer and transport named in
    /// `config` from the built-in loaders.
    ///
    /// # Errors
    ///
    /// `Configuration` if either name is unknown.
    pub fn new(config: ClientConfig, directory: Arc<ServiceDirectory>) -> Result<Self> {
        let load_balancer = builtin_load_balancers().get_extension(&config.load_balancer)?;
        let dialer = builtin_dialers().get_extension(&config.transport)?;
        Ok(Self::with_components(config, directory, load_balancer, dialer))
    }

    /// Creates a client with explicit components.
    pub fn with_components(
        config: ClientConfig,
        directory: Arc<ServiceDirectory>,
        load_balancer: Arc<dyn LoadBalance>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        let connections = ConnectionManager::new(config.connect_timeout);
        RpcClient {
            inner: Arc::new(ClientInner {
                config,
                directory,
                load_balancer,
                dialer,
                connections,
                pending: Arc::new(PendingRequests::new()),
                codec: RpcCodec::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.inner.pending
    }

    /// Builds a proxy for one service identity.
    pub fn proxy(&self, identity: ServiceIdentity) -> ServiceProxy {
        ServiceProxy::new(identity, Arc::new(self.clone()))
    }

    /// Picks an endpoint for `request` and sends it there.
    ///
    /// # Errors
    ///
    /// Routing (`ServiceNotFound`, `DirectoryUnavailable`) and connect
    /// (`Connection`) failures are returned directly. A failure after the
    /// request was registered resolves the returned handle instead.
    pub async fn send_request(&self, request: RpcRequest) -> Result<ResponseHandle> {
        let identity = request.service_identity();
        let snapshot = self.inner.directory.lookup(&identity).await?;
        let endpoint = self
            .inner
            .load_balancer
            .select(&snapshot, &request)
            .ok_or_else(|| RpcError::ServiceNotFound(format!("no endpoint selected for {}", identity)))?;
        debug!(service = %identity, %endpoint, request_id = %request.request_id, "routed request");
        self.send_request_to(&endpoint, request).await
    }

    /// Sends `request` to a specific endpoint, bypassing discovery.
    pub async fn send_request_to(&self, endpoint: &Endpoint, request: RpcRequest) -> Result<ResponseHandle> {
        let conn = self.connection(endpoint).await?;
        let request_id = request.request_id.clone();
        let handle = self.inner.pending.register(request_id.clone(), conn.id())?;

        if let Err(e) = conn.send_request(request) {
            warn!(%endpoint, %request_id, error = %e, "send failed, dropping connection");
            self.inner.connections.remove_if_same(endpoint, &conn);
            self.inner.pending.fail(&request_id, e);
        }
        Ok(handle)
    }

    /// Waits for `handle` up to the configured request timeout.
    ///
    /// On timeout the pending entry is evicted and `Timeout` is returned.
    /// A failure response becomes `Invocation`.
    pub async fn await_response(&self, handle: ResponseHandle) -> Result<Value> {
        let request_id = handle.request_id().to_string();
        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, handle).await {
            Ok(outcome) => outcome?.into_result(),
            Err(_) => {
                self.inner.pending.cancel(&request_id);
                warn!(%request_id, timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(RpcError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Routes, sends and waits for `request`.
    pub async fn call(&self, request: RpcRequest) -> Result<Value> {
        let handle = self.send_request(request).await?;
        self.await_response(handle).await
    }

    /// Fails every pending request and closes every connection.
    pub fn shutdown(&self) {
        let failed = self.inner.pending.fail_all("client shut down");
        self.inner.connections.close_all();
        info!(failed, "client shut down");
    }

    async fn connection(&self, endpoint: &Endpoint) -> Result<Arc<Connection>> {
        let inner = &self.inner;
        inner
            .connections
            .get_or_connect(endpoint, || async {
                let stream = inner.dialer.dial(endpoint).await?;
                Ok(Connection::spawn(
                    stream,
                    endpoint.clone(),
                    &inner.config,
                    inner.codec.clone(),
                    Arc::clone(&inner.pending),
                ))
            })
            .await
    }
}

#[async_trait]
impl RpcRequestTransport for RpcClient {
    async fn send_request(&self, request: RpcRequest) -> Result<ResponseHandle> {
        RpcClient::send_request(self, request).await
    }

    async fn call(&self, request: RpcRequest) -> Result<Value> {
        RpcClient::call(self, request).await
    }
}

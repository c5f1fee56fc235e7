use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use keelrpc_common::{Endpoint, Result, RpcError};

use crate::connection::Connection;

/// One reusable connection per endpoint.
///
/// Liveness is checked when a connection is looked up; nothing polls in
/// the background. Concurrent callers asking for the same missing
/// endpoint are serialized by a per-endpoint guard, so only one of them
/// connects and the rest reuse its result.
///
/// # Example
///
/// ```rust,no_run
/// use keelrpc_client::{ClientConfig, Connection, ConnectionManager, PendingRequests};
/// use keelrpc_common::{transport::RpcCodec, Endpoint};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> keelrpc_common::Result<()> {
/// let manager = ConnectionManager::new(Duration::from_secs(5));
/// let endpoint = Endpoint::new("127.0.0.1", 9998);
/// let pending = Arc::new(PendingRequests::new());
/// let target = endpoint.clone();
///
/// let conn = manager
///     .get_or_connect(&endpoint, move || async move {
///         let stream = tokio::net::TcpStream::connect("127.0.0.1:9998").await?;
///         Ok(Connection::spawn(stream, target, &ClientConfig::default(), RpcCodec::new(), pending))
///     })
///     .await?;
/// assert!(conn.is_active());
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    connections: RwLock<HashMap<Endpoint, Arc<Connection>>>,
    guards: Mutex<HashMap<Endpoint, Arc<tokio::sync::Mutex<()>>>>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(connect_timeout: Duration) -> Self {
        ConnectionManager {
            connections: RwLock::new(HashMap::new()),
            guards: Mutex::new(HashMap::new()),
            connect_timeout,
        }
    }

    /// Returns the cached connection if it is still active. A dead entry is
    /// evicted on the way.
    pub fn get(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let cached = self.connections.read().get(endpoint).cloned()?;
        if cached.is_active() {
            return Some(cached);
        }

        let mut connections = self.connections.write();
        if connections
            .get(endpoint)
            .map_or(false, |current| Arc::ptr_eq(current, &cached))
        {
            connections.remove(endpoint);
            debug!(%endpoint, "evicted dead connection");
        }
        None
    }

    /// Returns a live connection to `endpoint`, calling `connect` if there
    /// is none.
    ///
    /// # Errors
    ///
    /// `Connection` if `connect` does not finish within the connect
    /// timeout, or whatever `connect` itself returns. Failed attempts are
    /// not cached.
    pub async fn get_or_connect<F, Fut>(&self, endpoint: &Endpoint, connect: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Connection>>>,
    {
        if let Some(conn) = self.get(endpoint) {
            return Ok(conn);
        }

        let guard = self.guard(endpoint);
        let result = {
            let _connecting = guard.lock().await;
            match self.get(endpoint) {
                Some(conn) => Ok(conn),
                None => self.connect(endpoint, connect).await,
            }
        };
        self.release_guard(endpoint, guard);
        result
    }

    async fn connect<F, Fut>(&self, endpoint: &Endpoint, connect: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<Connection>>>,
    {
        let conn = match tokio::time::timeout(self.connect_timeout, connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(%endpoint, error = %e, "connect failed");
                return Err(e);
            }
            Err(_) => {
                warn!(%endpoint, timeout_ms = self.connect_timeout.as_millis() as u64, "connect timed out");
                return Err(RpcError::Connection(format!(
                    "connect to {} timed out after {}ms",
                    endpoint,
                    self.connect_timeout.as_millis()
                )));
            }
        };

        info!(%endpoint, connection_id = conn.id(), "connected");
        self.connections.write().insert(endpoint.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Evicts and closes the connection to `endpoint`, if any.
    pub fn remove(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(endpoint);
        if let Some(conn) = &removed {
            conn.close();
        }
        removed
    }

    /// Closes `conn` and evicts it only if it is still the cached connection
    /// for `endpoint`. A replacement cached by another caller is left alone.
    pub fn remove_if_same(&self, endpoint: &Endpoint, conn: &Arc<Connection>) -> bool {
        let evicted = {
            let mut connections = self.connections.write();
            let same = connections
                .get(endpoint)
                .map_or(false, |current| Arc::ptr_eq(current, conn));
            if same {
                connections.remove(endpoint);
            }
            same
        };
        conn.close();
        evicted
    }

    pub fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = self.connections.write().drain().map(|(_, conn)| conn).collect();
        for conn in drained {
            conn.close();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    fn guard(&self, endpoint: &Endpoint) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.guards.lock().entry(endpoint.clone()).or_default())
    }

    // Guards are cloned and released under the map lock, so a count of two
    // (map plus ours) means no other caller holds this one.
    fn release_guard(&self, endpoint: &Endpoint, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self.guards.lock();
        let idle = guards
            .get(endpoint)
            .map_or(false, |current| Arc::ptr_eq(current, &guard) && Arc::strong_count(&guard) == 2);
        drop(guard);
        if idle {
            guards.remove(endpoint);
        }
    }
}

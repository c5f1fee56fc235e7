//! Networked coordination store.
//!
//! [`StoreServer`] hosts a [`MemoryStore`] over TCP so that servers and
//! clients running in different processes share one directory.
//! [`RemoteStore`] is the matching [`CoordinationStore`] client.
//!
//! Messages are JSON, one per line. Every request carries an id echoed in
//! its reply; a watch keeps sending `changed` notifications under the id of
//! the request that installed it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keelrpc_common::{Result, RpcError};

use crate::store::{CoordinationStore, MemoryStore};

/// Environment variable naming the directory server address.
pub const DIRECTORY_ADDR_ENV: &str = "KEELRPC_DIRECTORY_ADDR";

pub const DEFAULT_DIRECTORY_ADDR: &str = "127.0.0.1:9990";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Wire messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoreOp {
    Create { path: String },
    Exists { path: String },
    Children { path: String },
    Delete { path: String },
    Watch { path: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreRequest {
    id: u64,
    op: StoreOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoreOutcome {
    Done,
    Exists(bool),
    Children(Vec<String>),
    Invalid(String),
    Unavailable(String),
}

impl StoreOutcome {
    fn from_error(error: RpcError) -> Self {
        match error {
            RpcError::Configuration(msg) => StoreOutcome::Invalid(msg),
            RpcError::DirectoryUnavailable(msg) => StoreOutcome::Unavailable(msg),
            other => StoreOutcome::Unavailable(other.to_string()),
        }
    }

    fn into_result(self) -> Result<StoreOutcome> {
        match self {
            StoreOutcome::Invalid(msg) => Err(RpcError::Configuration(msg)),
            StoreOutcome::Unavailable(msg) => Err(RpcError::DirectoryUnavailable(msg)),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoreMessage {
    Reply { id: u64, outcome: StoreOutcome },
    Changed { watch: u64 },
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

fn unavailable(msg: impl Into<String>) -> RpcError {
    RpcError::DirectoryUnavailable(msg.into())
}

// ============================================================================
// Server
// ============================================================================

/// Serves a [`MemoryStore`] to [`RemoteStore`] clients.
///
/// # Example
///
/// ```rust,no_run
/// use keelrpc_registry::{RemoteStore, ServiceDirectory, StoreServer};
/// use std::sync::Arc;
///
/// # async fn example() -> keelrpc_common::Result<()> {
/// let server = Arc::new(StoreServer::bind("127.0.0.1:9990").await?);
/// let running = Arc::clone(&server);
/// tokio::spawn(async move { running.run().await });
///
/// let directory = ServiceDirectory::new(Arc::new(RemoteStore::new("127.0.0.1:9990")));
/// directory.register(&"Echo".parse()?, &"10.0.0.5:9998".parse()?).await?;
/// # Ok(())
/// # }
/// ```
pub struct StoreServer {
    listener: TcpListener,
    store: Arc<MemoryStore>,
    shutdown: watch::Sender<bool>,
}

impl StoreServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_store(addr, Arc::new(MemoryStore::new())).await
    }

    /// Binds a server exposing an existing `store`.
    pub async fn bind_with_store(addr: &str, store: Arc<MemoryStore>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind directory to {}: {}", addr, e)))?;
        let (shutdown, _) = watch::channel(false);
        info!(addr, "directory bound");
        Ok(StoreServer {
            listener,
            store,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Accepts clients until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Failed to accept directory client");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            debug!(%peer, "directory client connected");
            tokio::spawn(serve_store_connection(
                stream,
                peer.to_string(),
                Arc::clone(&self.store),
                self.shutdown.subscribe(),
            ));
        }

        info!("directory accept loop stopped");
        Ok(())
    }

    /// Stops accepting and disconnects every client.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

async fn serve_store_connection(
    stream: TcpStream,
    peer: String,
    store: Arc<MemoryStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound, mut queued) = mpsc::unbounded_channel::<StoreMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = queued.recv().await {
            if let Err(e) = write_line(&mut write_half, &message).await {
                debug!(error = %e, "directory write failed");
                break;
            }
        }
    });

    let mut watches: Vec<JoinHandle<()>> = Vec::new();
    let mut lines = BufReader::new(read_half).lines();
    let reason = loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break "directory shut down".to_string(),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break "closed by peer".to_string(),
            Err(e) => break format!("read failed: {}", e),
        };
        let request: StoreRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => break format!("malformed request: {}", e),
        };

        let outcome = apply(&store, request.id, request.op, &outbound, &mut watches).await;
        if outbound.send(StoreMessage::Reply { id: request.id, outcome }).is_err() {
            break "writer closed".to_string();
        }
    };

    debug!(%peer, %reason, watches = watches.len(), "directory client disconnected");
    for task in watches {
        task.abort();
    }
    drop(outbound);
    let _ = writer.await;
}

async fn apply(
    store: &MemoryStore,
    id: u64,
    op: StoreOp,
    outbound: &mpsc::UnboundedSender<StoreMessage>,
    watches: &mut Vec<JoinHandle<()>>,
) -> StoreOutcome {
    let result = match op {
        StoreOp::Create { path } => store.create_persistent(&path).await.map(|()| StoreOutcome::Done),
        StoreOp::Exists { path } => store.exists(&path).await.map(StoreOutcome::Exists),
        StoreOp::Children { path } => store.children(&path).await.map(StoreOutcome::Children),
        StoreOp::Delete { path } => store.delete(&path).await.map(|()| StoreOutcome::Done),
        StoreOp::Watch { path } => store.watch_children(&path).await.map(|mut changes| {
            let outbound = outbound.clone();
            watches.push(tokio::spawn(async move {
                while changes.recv().await.is_some() {
                    if outbound.send(StoreMessage::Changed { watch: id }).is_err() {
                        break;
                    }
                }
            }));
            StoreOutcome::Done
        }),
    };
    result.unwrap_or_else(StoreOutcome::from_error)
}

// ============================================================================
// Client
// ============================================================================

#[derive(Default)]
struct SessionState {
    pending: Mutex<HashMap<u64, oneshot::Sender<StoreOutcome>>>,
    watchers: Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>,
    closed: AtomicBool,
}

impl SessionState {
    /// Marks the session dead. Waiting requests see their reply channel
    /// close and every watch receiver ends.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.watchers.lock().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn forget(&self, id: u64) {
        self.pending.lock().remove(&id);
        self.watchers.lock().remove(&id);
    }
}

struct Session {
    outbound: mpsc::UnboundedSender<StoreRequest>,
    state: Arc<SessionState>,
    reader: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(read_half: OwnedReadHalf, state: Arc<SessionState>) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("directory closed the connection");
                break;
            }
            Err(e) => {
                debug!(error = %e, "directory read failed");
                break;
            }
        };

        match serde_json::from_str::<StoreMessage>(&line) {
            Ok(StoreMessage::Reply { id, outcome }) => match state.pending.lock().remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(id, "reply for an abandoned directory request"),
            },
            Ok(StoreMessage::Changed { watch }) => {
                let mut watchers = state.watchers.lock();
                let dropped = watchers.get(&watch).map_or(false, |tx| tx.send(()).is_err());
                if dropped {
                    watchers.remove(&watch);
                }
            }
            Err(e) => {
                warn!(error = %e, "malformed directory message");
                break;
            }
        }
    }
    state.close();
}

/// [`CoordinationStore`] backed by a [`StoreServer`].
///
/// Connects lazily on first use and reconnects on the next call after the
/// connection drops. Any failure to reach the server, or a reply that does
/// not arrive within the request timeout, is `DirectoryUnavailable`. Watch
/// receivers end when their connection drops.
pub struct RemoteStore {
    addr: String,
    request_timeout: Duration,
    next_id: AtomicU64,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
}

impl RemoteStore {
    pub fn new(addr: impl Into<String>) -> Self {
        RemoteStore {
            addr: addr.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: AtomicU64::new(1),
            session: tokio::sync::Mutex::new(None),
        }
    }

    /// Uses `KEELRPC_DIRECTORY_ADDR`, falling back to `127.0.0.1:9990`.
    pub fn from_env() -> Self {
        let addr = std::env::var(DIRECTORY_ADDR_ENV).unwrap_or_else(|_| DEFAULT_DIRECTORY_ADDR.to_string());
        Self::new(addr)
    }

    /// Bounds both connecting and waiting for each reply.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn session(&self) -> Result<Arc<Session>> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.state.is_closed() {
                return Ok(Arc::clone(session));
            }
            debug!(addr = %self.addr, "directory connection lost, reconnecting");
        }

        let session = Arc::new(self.connect().await?);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn connect(&self) -> Result<Session> {
        let stream = match tokio::time::timeout(self.request_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(unavailable(format!("cannot reach directory at {}: {}", self.addr, e))),
            Err(_) => return Err(unavailable(format!("connect to directory at {} timed out", self.addr))),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }

        let (read_half, mut write_half) = stream.into_split();
        let state = Arc::new(SessionState::default());
        let (outbound, mut queued) = mpsc::unbounded_channel::<StoreRequest>();

        let writer_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(request) = queued.recv().await {
                if let Err(e) = write_line(&mut write_half, &request).await {
                    debug!(error = %e, "directory write failed");
                    writer_state.close();
                    break;
                }
            }
        });
        let reader = tokio::spawn(read_replies(read_half, Arc::clone(&state)));

        info!(addr = %self.addr, "connected to directory");
        Ok(Session {
            outbound,
            state,
            reader,
        })
    }

    async fn request(&self, op: StoreOp, watcher: Option<mpsc::UnboundedSender<()>>) -> Result<StoreOutcome> {
        let session = self.session().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        session.state.pending.lock().insert(id, tx);
        if let Some(watcher) = watcher {
            session.state.watchers.lock().insert(id, watcher);
        }

        if session.state.is_closed() || session.outbound.send(StoreRequest { id, op }).is_err() {
            session.state.forget(id);
            return Err(unavailable(format!("directory connection to {} closed", self.addr)));
        }

        let outcome = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                session.state.forget(id);
                return Err(unavailable(format!("directory connection to {} lost", self.addr)));
            }
            Err(_) => {
                session.state.forget(id);
                return Err(unavailable(format!(
                    "directory at {} did not answer within {}ms",
                    self.addr,
                    self.request_timeout.as_millis()
                )));
            }
        };

        let result = outcome.into_result();
        if result.is_err() {
            session.state.watchers.lock().remove(&id);
        }
        result
    }
}

fn unexpected(outcome: StoreOutcome) -> RpcError {
    unavailable(format!("unexpected directory reply: {:?}", outcome))
}

fn expect_done(outcome: StoreOutcome) -> Result<()> {
    match outcome {
        StoreOutcome::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

#[async_trait]
impl CoordinationStore for RemoteStore {
    async fn create_persistent(&self, path: &str) -> Result<()> {
        expect_done(self.request(StoreOp::Create { path: path.to_string() }, None).await?)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.request(StoreOp::Exists { path: path.to_string() }, None).await? {
            StoreOutcome::Exists(found) => Ok(found),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        match self.request(StoreOp::Children { path: path.to_string() }, None).await? {
            StoreOutcome::Children(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        expect_done(self.request(StoreOp::Delete { path: path.to_string() }, None).await?)
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        expect_done(self.request(StoreOp::Watch { path: path.to_string() }, Some(tx)).await?)?;
        Ok(rx)
    }
}

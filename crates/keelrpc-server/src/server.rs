use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, info, warn};

use keelrpc_common::transport::RpcCodec;
use keelrpc_common::{
    CompressionKind, Endpoint, Envelope, Payload, Result, RpcError, RpcRequest, RpcResponse,
    SerializationKind,
};
use keelrpc_registry::ServiceDirectory;

use crate::config::ServerConfig;
use crate::dispatcher::RequestDispatcher;
use crate::provider::ServiceProvider;
use crate::service::Service;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Everything a connection task needs, shared by all connections of a
/// server.
#[derive(Clone)]
pub struct ConnectionContext {
    dispatcher: Arc<RequestDispatcher>,
    workers: Arc<Semaphore>,
    codec: RpcCodec,
    idle_timeout: Duration,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionContext {
    pub fn new(dispatcher: Arc<RequestDispatcher>, config: &ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        ConnectionContext {
            dispatcher,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            codec: RpcCodec::new(),
            idle_timeout: config.idle_timeout,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Tells every connection (and the accept loop) to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// keelrpc TCP server.
///
/// Accepts connections in a loop and serves each one on its own task.
/// Request frames are dispatched on the blocking pool, at most
/// `workers` at a time, so a slow operation never stalls socket I/O.
///
/// # Example
///
/// ```rust,no_run
/// use keelrpc_registry::{MemoryStore, ServiceDirectory};
/// use keelrpc_server::{RpcServer, Service, ServerConfig};
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// # async fn example() -> keelrpc_common::Result<()> {
/// let directory = Arc::new(ServiceDirectory::new(Arc::new(MemoryStore::new())));
/// let server = RpcServer::bind(ServerConfig::default().with_bind("127.0.0.1:0"), directory).await?;
///
/// server
///     .publish(Service::new("Echo::demo::1".parse()?).operation("echo", &["String"], |args| {
///         Ok(args.into_iter().next().unwrap_or(Value::Null))
///     }))
///     .await?;
///
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct RpcServer {
    listener: TcpListener,
    endpoint: Endpoint,
    provider: Arc<ServiceProvider>,
    context: ConnectionContext,
    accepted: AtomicU64,
}

impl RpcServer {
    /// Binds the listener and works out the endpoint to advertise.
    pub async fn bind(config: ServerConfig, directory: Arc<ServiceDirectory>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|e| RpcError::Connection(format!("Failed to bind to {}: {}", config.bind, e)))?;
        let local = listener.local_addr()?;
        let endpoint = config.advertised_endpoint(local);

        let provider = Arc::new(ServiceProvider::new(directory));
        let dispatcher = Arc::new(RequestDispatcher::new(Arc::clone(&provider)));
        let context = ConnectionContext::new(dispatcher, &config);

        info!(%local, %endpoint, workers = config.workers, idle_timeout_ms = config.idle_timeout.as_millis() as u64, "server bound");
        Ok(RpcServer {
            listener,
            endpoint,
            provider,
            context,
            accepted: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| RpcError::Connection(format!("Failed to get local addr: {}", e)))
    }

    /// The endpoint registered in the directory for published services.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn provider(&self) -> &Arc<ServiceProvider> {
        &self.provider
    }

    /// Number of connections accepted since the server started.
    pub fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Adds `service` and registers this server's endpoint for it.
    pub async fn publish(&self, service: Service) -> Result<()> {
        self.provider.publish_service(service, &self.endpoint).await
    }

    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<()> {
        let mut shutdown = self.context.shutdown.subscribe();
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
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "could not set TCP_NODELAY");
            }

            self.accepted.fetch_add(1, Ordering::Relaxed);
            info!(%peer, "connection accepted");
            tokio::spawn(serve_connection(stream, peer.to_string(), self.context.clone()));
        }

        info!(endpoint = %self.endpoint, "accept loop stopped");
        Ok(())
    }

    /// Stops accepting, closes open connections and removes this server's
    /// endpoint from the directory.
    pub async fn shutdown(&self) -> Result<()> {
        self.context.shutdown();
        let removed = self.provider.directory().deregister(&self.endpoint).await?;
        info!(endpoint = %self.endpoint, removed, "server shut down");
        Ok(())
    }
}

/// Serves one connection until the peer leaves, it idles past the
/// configured timeout, the stream becomes undecodable or the server shuts
/// down.
///
/// PING frames are answered with PONG immediately. Responses reuse the
/// serializer and compressor of the request they answer.
pub async fn serve_connection<S>(stream: S, peer: String, context: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let writer_task = tokio::spawn(write_frames(
        writer,
        outbound_rx,
        closed_rx,
        context.codec.clone(),
        peer.clone(),
    ));

    let mut shutdown = context.shutdown.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let reason = 'read: loop {
        if *shutdown.borrow() {
            break 'read "server shutting down".to_string();
        }
        let read = tokio::select! {
            _ = shutdown.changed() => break 'read "server shutting down".to_string(),
            read = tokio::time::timeout(context.idle_timeout, reader.read_buf(&mut buf)) => read,
        };

        match read {
            Err(_) => {
                break 'read format!(
                    "no inbound traffic for {}ms",
                    context.idle_timeout.as_millis()
                )
            }
            Ok(Ok(0)) => break 'read "closed by peer".to_string(),
            Ok(Err(e)) => break 'read format!("read failed: {}", e),
            Ok(Ok(_)) => {}
        }

        loop {
            match context.codec.decode(&mut buf) {
                Ok(Some(envelope)) => handle_frame(envelope, &context, &outbound, &peer),
                Ok(None) => break,
                Err(e) if e.is_fatal_for_connection() => {
                    warn!(%peer, error = %e, "undecodable stream");
                    break 'read format!("decode failed: {}", e);
                }
                Err(e) => warn!(%peer, error = %e, "dropping undecodable frame"),
            }
        }
    };

    info!(%peer, %reason, "closing connection");
    closed_tx.send_replace(true);
    drop(outbound);
    let _ = writer_task.await;
}

fn handle_frame(
    envelope: Envelope,
    context: &ConnectionContext,
    outbound: &mpsc::UnboundedSender<Envelope>,
    peer: &str,
) {
    let (codec, compress) = (envelope.codec, envelope.compress);
    match envelope.payload {
        Payload::Ping => {
            debug!(%peer, sequence = envelope.sequence, "heartbeat ping");
            send_pong(outbound, codec, compress, peer);
        }
        Payload::Request(request) => {
            debug!(%peer, request_id = %request.request_id, sequence = envelope.sequence, "request received");
            tokio::spawn(dispatch(
                request,
                (codec, compress),
                context.clone(),
                outbound.clone(),
                peer.to_string(),
            ));
        }
        Payload::Response(response) => {
            warn!(%peer, request_id = %response.request_id, "ignoring response sent to a server");
        }
        Payload::Pong => debug!(%peer, "ignoring pong"),
    }
}

/// Queues a PONG answering a PING. Returns false if the writer is gone.
fn send_pong(
    outbound: &mpsc::UnboundedSender<Envelope>,
    codec: SerializationKind,
    compress: CompressionKind,
    peer: &str,
) -> bool {
    match outbound.send(Envelope::pong(codec, compress)) {
        Ok(()) => true,
        Err(_) => {
            debug!(%peer, "connection closed before pong could be queued");
            false
        }
    }
}

async fn dispatch(
    request: RpcRequest,
    kinds: (SerializationKind, CompressionKind),
    context: ConnectionContext,
    outbound: mpsc::UnboundedSender<Envelope>,
    peer: String,
) {
    let request_id = request.request_id.clone();
    let response = match Arc::clone(&context.workers).acquire_owned().await {
        Ok(permit) => {
            let dispatcher = Arc::clone(&context.dispatcher);
            let outcome = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                dispatcher.dispatch(&request)
            })
            .await;
            match outcome {
                Ok(response) => response,
                Err(e) => {
                    warn!(%peer, %request_id, error = %e, "operation panicked");
                    RpcResponse::fail(request_id.clone(), RpcError::Invocation(format!("operation panicked: {}", e)))
                }
            }
        }
        Err(_) => RpcResponse::fail(request_id.clone(), "server is shutting down"),
    };

    if outbound.is_closed() {
        let undeliverable = RpcResponse::fail(request_id, "connection is not writable");
        warn!(%peer, request_id = %undeliverable.request_id, message = %undeliverable.message, "dropping response");
        return;
    }
    if outbound.send(Envelope::response(kinds.0, kinds.1, response)).is_err() {
        warn!(%peer, %request_id, "connection closed before response could be queued");
    }
}

async fn write_frames<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut closed: watch::Receiver<bool>,
    codec: RpcCodec,
    peer: String,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let envelope = tokio::select! {
            _ = closed.changed() => break,
            next = outbound.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = codec.encode(&envelope, &mut buf) {
            warn!(%peer, sequence = envelope.sequence, error = %e, "failed to encode frame");
            buf.clear();
            match &envelope.payload {
                Payload::Response(response) => {
                    let fallback = RpcResponse::fail(response.request_id.clone(), e);
                    if codec
                        .encode(&Envelope::response(envelope.codec, envelope.compress, fallback), &mut buf)
                        .is_err()
                    {
                        continue;
                    }
                }
                _ => continue,
            }
        }

        let written = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(%peer, error = %e, "write failed");
            break;
        }
    }

    outbound.close();
    let _ = writer.shutdown().await;
}

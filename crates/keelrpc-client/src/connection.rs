use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use keelrpc_common::transport::RpcCodec;
use keelrpc_common::{CompressionKind, Endpoint, Envelope, Payload, Result, RpcError, RpcRequest, SerializationKind};

use crate::config::ClientConfig;
use crate::pending::PendingRequests;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

struct Shared {
    id: u64,
    endpoint: Endpoint,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    pending: Arc<PendingRequests>,
}

impl Shared {
    /// Marks the connection dead and fails whatever is still waiting on it.
    /// Safe to call from both tasks and more than once.
    fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(endpoint = %self.endpoint, connection_id = self.id, reason, "connection closed");
        }
        self.shutdown.send_replace(true);
        self.pending.fail_connection(self.id, reason);
    }
}

/// One multiplexed connection to a server.
///
/// Two background tasks own the socket halves. The writer drains an
/// outbound queue and sends a heartbeat PING whenever nothing was written
/// for `heartbeat_interval`. The reader decodes frames and resolves pending
/// requests by `request_id`, so responses may arrive in any order.
///
/// When either side stops (EOF, I/O error, framing error, [`close`](Self::close))
/// the connection is marked inactive and every request pending on it fails.
pub struct Connection {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Envelope>,
    serializer: SerializationKind,
    compressor: CompressionKind,
}

impl Connection {
    /// Starts the reader and writer tasks over `stream`.
    pub fn spawn<S>(
        stream: S,
        endpoint: Endpoint,
        config: &ClientConfig,
        codec: RpcCodec,
        pending: Arc<PendingRequests>,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            closed: AtomicBool::new(false),
            shutdown,
            pending,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (reader, writer) = tokio::io::split(stream);

        tokio::spawn(write_loop(
            writer,
            outbound_rx,
            shutdown_rx.clone(),
            Arc::clone(&shared),
            codec.clone(),
            config.heartbeat_interval,
            (config.serializer, config.compressor),
        ));
        tokio::spawn(read_loop(reader, shutdown_rx, Arc::clone(&shared), codec));

        debug!(endpoint = %shared.endpoint, connection_id = shared.id, "connection established");
        Arc::new(Connection {
            shared,
            outbound,
            serializer: config.serializer,
            compressor: config.compressor,
        })
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    pub fn is_active(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Queues a request for the writer task.
    ///
    /// # Errors
    ///
    /// `Connection` if the connection is already closed. A write that
    /// fails later is reported through the request's pending entry.
    pub fn send_request(&self, request: RpcRequest) -> Result<()> {
        self.send(Envelope::request(self.serializer, self.compressor, request))
    }

    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if !self.is_active() {
            return Err(RpcError::Connection(format!(
                "connection to {} is closed",
                self.shared.endpoint
            )));
        }
        self.outbound.send(envelope).map_err(|_| {
            RpcError::Connection(format!("connection to {} is closed", self.shared.endpoint))
        })
    }

    pub fn close(&self) {
        self.shared.close("closed by client");
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn write_loop<S: AsyncWrite>(
    mut writer: WriteHalf<S>,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
    codec: RpcCodec,
    heartbeat_interval: Duration,
    heartbeat_kinds: (SerializationKind, CompressionKind),
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let reason = loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break "shutdown requested",
            next = tokio::time::timeout(heartbeat_interval, outbound.recv()) => next,
        };

        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break "connection handle dropped",
            Err(_idle) => {
                debug!(endpoint = %shared.endpoint, "write idle, sending heartbeat");
                Envelope::ping(heartbeat_kinds.0, heartbeat_kinds.1)
            }
        };

        buf.clear();
        if let Err(e) = codec.encode(&envelope, &mut buf) {
            // Encoding is per message; the stream is still intact.
            fail_envelope(&shared, &envelope, e);
            continue;
        }

        let written = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            warn!(endpoint = %shared.endpoint, sequence = envelope.sequence, error = %e, "write failed");
            fail_envelope(&shared, &envelope, RpcError::Connection(format!("write to {} failed: {}", shared.endpoint, e)));
            break "write failed";
        }
    };

    outbound.close();
    while let Ok(envelope) = outbound.try_recv() {
        fail_envelope(
            &shared,
            &envelope,
            RpcError::Connection(format!("connection to {} closed before send", shared.endpoint)),
        );
    }
    shared.close(reason);
    let _ = writer.shutdown().await;
}

fn fail_envelope(shared: &Shared, envelope: &Envelope, error: RpcError) {
    match &envelope.payload {
        Payload::Request(request) => {
            shared.pending.fail(&request.request_id, error);
        }
        _ => debug!(sequence = envelope.sequence, error = %error, "dropping unsent frame"),
    }
}

async fn read_loop<S: AsyncRead>(
    mut reader: ReadHalf<S>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
    codec: RpcCodec,
) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let reason = 'read: loop {
        let read = tokio::select! {
            _ = shutdown.changed() => break 'read "shutdown requested".to_string(),
            read = reader.read_buf(&mut buf) => read,
        };

        match read {
            Ok(0) => break 'read "closed by peer".to_string(),
            Ok(_) => {}
            Err(e) => break 'read format!("read failed: {}", e),
        }

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(envelope)) => handle_inbound(&shared, envelope),
                Ok(None) => break,
                Err(e) if e.is_fatal_for_connection() => {
                    warn!(endpoint = %shared.endpoint, error = %e, "undecodable stream");
                    break 'read format!("decode failed: {}", e);
                }
                Err(e) => {
                    warn!(endpoint = %shared.endpoint, error = %e, "dropping undecodable frame");
                }
            }
        }
    };

    shared.close(&reason);
}

fn handle_inbound(shared: &Shared, envelope: Envelope) {
    match envelope.payload {
        Payload::Response(response) => {
            let request_id = response.request_id.clone();
            if let Err(e) = shared.pending.resolve(response) {
                warn!(endpoint = %shared.endpoint, %request_id, error = %e, "unmatched response");
            }
        }
        Payload::Pong => {
            debug!(endpoint = %shared.endpoint, sequence = envelope.sequence, "heartbeat pong");
        }
        Payload::Ping => {
            debug!(endpoint = %shared.endpoint, sequence = envelope.sequence, "ignoring ping from server");
        }
        Payload::Request(request) => {
            warn!(endpoint = %shared.endpoint, request_id = %request.request_id, "ignoring request sent to a client");
        }
    }
}

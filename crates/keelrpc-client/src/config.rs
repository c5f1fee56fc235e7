use std::time::Duration;

use keelrpc_common::{CompressionKind, SerializationKind};

/// Client configuration.
///
/// # Default Configuration
///
/// - `connect_timeout`: 5 seconds
/// - `heartbeat_interval`: 30 seconds of write idleness before a PING
/// - `request_timeout`: 30 seconds for [`RpcClient::call`](crate::RpcClient::call)
/// - `serializer` / `compressor`: `json` / `deflate`
/// - `load_balancer`: `consistent_hash`
/// - `transport`: `tcp`
///
/// # Example
///
/// ```rust
/// use keelrpc_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_load_balancer("random")
///     .with_request_timeout(Duration::from_secs(2));
/// assert_eq!(config.load_balancer, "random");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub serializer: SerializationKind,
    pub compressor: CompressionKind,
    pub load_balancer: String,
    pub transport: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            serializer: SerializationKind::Json,
            compressor: CompressionKind::Deflate,
            load_balancer: "consistent_hash".to_string(),
            transport: "tcp".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_serializer(mut self, serializer: SerializationKind) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_compressor(mut self, compressor: CompressionKind) -> Self {
        self.compressor = compressor;
        self
    }

    pub fn with_load_balancer(mut self, name: impl Into<String>) -> Self {
        self.load_balancer = name.into();
        self
    }

    pub fn with_transport(mut self, name: impl Into<String>) -> Self {
        self.transport = name.into();
        self
    }
}

use std::net::SocketAddr;
use std::time::Duration;
use tracing::warn;

use keelrpc_common::{Endpoint, Result};

/// Environment variable overriding the endpoint published to the directory.
pub const ADVERTISE_ADDR_ENV: &str = "KEELRPC_ADVERTISE_ADDR";

/// Server configuration.
///
/// # Default Configuration
///
/// - `bind`: `0.0.0.0:9998`
/// - `advertise`: derived from the bound address
/// - `idle_timeout`: 60 seconds without inbound traffic closes a connection.
///   Keep it a multiple of the clients' heartbeat interval.
/// - `workers`: twice the available cores
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub advertise: Option<Endpoint>,
    pub idle_timeout: Duration,
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            bind: "0.0.0.0:9998".to_string(),
            advertise: None,
            idle_timeout: Duration::from_secs(60),
            workers: cores * 2,
        }
    }
}

impl ServerConfig {
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_advertise(mut self, endpoint: Endpoint) -> Self {
        self.advertise = Some(endpoint);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Applies `KEELRPC_ADVERTISE_ADDR` if it is set.
    ///
    /// # Errors
    ///
    /// `Configuration` if the variable is set but is not `host:port`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ADVERTISE_ADDR_ENV) {
            let endpoint = value.parse::<Endpoint>()?;
            self.advertise = Some(endpoint);
        }
        Ok(self)
    }

    /// The endpoint to publish for a server bound to `local`.
    ///
    /// An explicit `advertise` wins. Otherwise the bound address is used,
    /// with an unspecified IP (`0.0.0.0`, `::`) replaced by loopback.
    pub fn advertised_endpoint(&self, local: SocketAddr) -> Endpoint {
        if let Some(endpoint) = &self.advertise {
            return endpoint.clone();
        }
        if local.ip().is_unspecified() {
            warn!(%local, "bound to an unspecified address, advertising loopback; set {} for remote clients", ADVERTISE_ADDR_ENV);
            let loopback = if local.is_ipv4() { "127.0.0.1" } else { "::1" };
            return Endpoint::new(loopback, local.port());
        }
        Endpoint::from(local)
    }
}

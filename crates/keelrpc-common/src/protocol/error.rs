use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invocation error: {0}")]
    Invocation(String),

    #[error("Correlation error: {0}")]
    Correlation(String),

    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    /// Whether the error leaves the byte stream in an unknown state.
    ///
    /// A framing error means the decoder can no longer find frame
    /// boundaries, so the connection has to be dropped. Everything else
    /// is scoped to a single frame or call.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, RpcError::Framing(_) | RpcError::Io(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for RpcError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for RpcError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

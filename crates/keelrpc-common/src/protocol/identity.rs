//! Routing keys: who provides a service and where it runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use super::error::{Result, RpcError};

const SEPARATOR: &str = "::";

/// Interface name plus group and version.
///
/// Group and version default to empty, which lets several implementations
/// of one interface coexist under different groups or versions. The text
/// form is `interface::group::version`; an identity with neither group nor
/// version prints as the bare interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub interface: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
}

impl ServiceIdentity {
    pub fn new(interface: impl Into<String>) -> Self {
        ServiceIdentity {
            interface: interface.into(),
            group: String::new(),
            version: String::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() && self.version.is_empty() {
            write!(f, "{}", self.interface)
        } else {
            write!(f, "{}{SEPARATOR}{}{SEPARATOR}{}", self.interface, self.group, self.version)
        }
    }
}

impl FromStr for ServiceIdentity {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(SEPARATOR);
        let interface = parts.next().unwrap_or_default();
        if interface.is_empty() {
            return Err(RpcError::Configuration(format!(
                "service identity '{}' has no interface name",
                s
            )));
        }
        let group = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(RpcError::Configuration(format!(
                "service identity '{}' has more than three segments",
                s
            )));
        }
        Ok(ServiceIdentity::new(interface)
            .with_group(group)
            .with_version(version))
    }
}

/// A reachable server process. Its string form `host:port` is used as the
/// directory node name and as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RpcError::Configuration(format!("endpoint '{}' is not host:port", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(RpcError::Configuration(format!("endpoint '{}' has no host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RpcError::Configuration(format!("endpoint '{}' has a bad port: {}", s, e)))?;
        Ok(Endpoint::new(host, port))
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

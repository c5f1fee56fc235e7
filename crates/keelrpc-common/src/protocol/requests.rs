use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use super::identity::ServiceIdentity;

pub type RequestId = String;
pub type RpcArgs = Vec<serde_json::Value>;

static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A logical call: which service, which operation, with which arguments.
///
/// `request_id` is the correlation key. The server copies it verbatim into
/// the matching [`RpcResponse`](super::RpcResponse), and the client's pending
/// table is keyed by it.
///
/// # Example
///
/// ```
/// use keelrpc_common::{RpcRequest, ServiceIdentity};
/// use serde_json::json;
///
/// let identity = ServiceIdentity::new("Hello").with_group("g1").with_version("v1");
/// let request = RpcRequest::new(&identity, "hello")
///     .with_arg("java.lang.String", json!("hi"));
///
/// assert_eq!(request.service_identity().to_string(), "Hello::g1::v1");
/// assert_eq!(request.args, vec![json!("hi")]);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub request_id: RequestId,
    pub interface_name: String,
    pub operation: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arg_types: Vec<String>,
    #[serde(default)]
    pub args: RpcArgs,
}

impl RpcRequest {
    /// Creates a request with a fresh id and no arguments.
    pub fn new(identity: &ServiceIdentity, operation: impl Into<String>) -> Self {
        RpcRequest {
            request_id: generate_request_id(),
            interface_name: identity.interface.clone(),
            operation: operation.into(),
            group: identity.group.clone(),
            version: identity.version.clone(),
            arg_types: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Appends one argument together with its declared type name.
    pub fn with_arg(mut self, arg_type: impl Into<String>, value: serde_json::Value) -> Self {
        self.arg_types.push(arg_type.into());
        self.args.push(value);
        self
    }

    /// Replaces the argument list wholesale.
    pub fn with_args(mut self, arg_types: Vec<String>, args: RpcArgs) -> Self {
        self.arg_types = arg_types;
        self.args = args;
        self
    }

    pub fn service_identity(&self) -> ServiceIdentity {
        ServiceIdentity {
            interface: self.interface_name.clone(),
            group: self.group.clone(),
            version: self.version.clone(),
        }
    }
}

/// Builds an id that stays unique across processes started at different
/// times and across threads within one process.
pub fn generate_request_id() -> RequestId {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let counter = REQUEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{:016x}-{:08x}-{:x}", timestamp, std::process::id(), counter)
}

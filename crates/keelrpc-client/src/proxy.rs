use serde_json::Value;
use std::sync::Arc;

use keelrpc_common::{Result, RpcRequest, ServiceIdentity};

use crate::client::RpcRequestTransport;

/// Call-site handle for one remote service.
///
/// Turns `(operation, argument types, arguments)` into an [`RpcRequest`]
/// with a fresh id and hands it to the transport.
#[derive(Clone)]
pub struct ServiceProxy {
    identity: ServiceIdentity,
    transport: Arc<dyn RpcRequestTransport>,
}

impl ServiceProxy {
    pub fn new(identity: ServiceIdentity, transport: Arc<dyn RpcRequestTransport>) -> Self {
        ServiceProxy { identity, transport }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Builds the request without sending it.
    pub fn request(&self, operation: &str, arg_types: Vec<String>, args: Vec<Value>) -> RpcRequest {
        RpcRequest::new(&self.identity, operation).with_args(arg_types, args)
    }

    /// Invokes `operation` remotely and returns its result value.
    pub async fn call(&self, operation: &str, arg_types: Vec<String>, args: Vec<Value>) -> Result<Value> {
        self.transport.call(self.request(operation, arg_types, args)).await
    }
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy").field("identity", &self.identity).finish()
    }
}

use std::sync::Arc;
use tracing::{debug, warn};

use keelrpc_common::{RpcError, RpcRequest, RpcResponse};

use crate::provider::ServiceProvider;

/// Turns a request into a response by calling the registered operation.
///
/// Every failure (unknown service, unknown operation, an operation
/// returning an error) becomes a failure response carrying the request id.
/// Nothing here can take down the connection.
pub struct RequestDispatcher {
    provider: Arc<ServiceProvider>,
}

impl RequestDispatcher {
    pub fn new(provider: Arc<ServiceProvider>) -> Self {
        RequestDispatcher { provider }
    }

    pub fn provider(&self) -> &Arc<ServiceProvider> {
        &self.provider
    }

    /// Runs the operation synchronously on the calling thread.
    pub fn dispatch(&self, request: &RpcRequest) -> RpcResponse {
        let identity = request.service_identity();
        let request_id = request.request_id.clone();

        let service = match self.provider.get_service(&identity) {
            Ok(service) => service,
            Err(e) => {
                warn!(service = %identity, %request_id, "service not published");
                return RpcResponse::fail(request_id, e);
            }
        };

        let operation = match service.find(&request.operation, &request.arg_types) {
            Some(operation) => operation,
            None => {
                let e = RpcError::Invocation(format!(
                    "{} has no operation {}({})",
                    identity,
                    request.operation,
                    request.arg_types.join(", ")
                ));
                warn!(service = %identity, %request_id, error = %e, "unknown operation");
                return RpcResponse::fail(request_id, e);
            }
        };

        match operation(request.args.clone()) {
            Ok(value) => {
                debug!(service = %identity, operation = %request.operation, %request_id, "invocation succeeded");
                RpcResponse::success(request_id, value)
            }
            Err(e) => {
                warn!(service = %identity, operation = %request.operation, %request_id, error = %e, "invocation failed");
                RpcResponse::fail(request_id, RpcError::Invocation(e.to_string()))
            }
        }
    }
}

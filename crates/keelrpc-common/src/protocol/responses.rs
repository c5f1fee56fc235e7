//! Response types returned by the server.

use serde::{Deserialize, Serialize};

use super::RequestId;

pub const SUCCESS_CODE: u16 = 200;
pub const FAIL_CODE: u16 = 500;
pub const SUCCESS_MESSAGE: &str = "The remote call is successful";
pub const FAIL_MESSAGE: &str = "The remote call is fail";

/// The outcome of one [`RpcRequest`](super::RpcRequest).
///
/// A failure response still carries the originating `request_id`, so the
/// client can resolve the right pending handle either way.
///
/// # Example
///
/// ```
/// use keelrpc_common::RpcResponse;
/// use serde_json::json;
///
/// let ok = RpcResponse::success("abc".to_string(), json!("hi"));
/// assert!(ok.is_success());
///
/// let failed = RpcResponse::fail("abc".to_string(), "no such operation");
/// assert_eq!(failed.code, 500);
/// assert_eq!(failed.message, "The remote call is fail: no such operation");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub request_id: RequestId,
    pub code: u16,
    pub message: String,
    /// The operation's return value; `Null` for void operations and failures.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RpcResponse {
    /// Creates a successful response carrying the operation's return value.
    pub fn success(request_id: RequestId, data: serde_json::Value) -> Self {
        RpcResponse {
            request_id,
            code: SUCCESS_CODE,
            message: SUCCESS_MESSAGE.to_string(),
            data,
        }
    }

    /// Creates a failure response. `detail` is appended to the fixed message.
    pub fn fail(request_id: RequestId, detail: impl std::fmt::Display) -> Self {
        RpcResponse {
            request_id,
            code: FAIL_CODE,
            message: format!("{}: {}", FAIL_MESSAGE, detail),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// Unwraps the result value, turning a failure response into an
    /// invocation error.
    pub fn into_result(self) -> crate::Result<serde_json::Value> {
        if self.is_success() {
            Ok(self.data)
        } else {
            Err(crate::RpcError::Invocation(format!(
                "request {} failed with code {}: {}",
                self.request_id, self.code, self.message
            )))
        }
    }
}

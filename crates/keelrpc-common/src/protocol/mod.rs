pub mod envelope;
pub mod error;
pub mod identity;
pub mod requests;
pub mod responses;


pub use envelope::{CompressionKind, Envelope, MessageType, Payload, SerializationKind};
pub use error::{Result, RpcError};
pub use identity::{Endpoint, ServiceIdentity};
pub use requests::{generate_request_id, RequestId, RpcArgs, RpcRequest};
pub use responses::RpcResponse;

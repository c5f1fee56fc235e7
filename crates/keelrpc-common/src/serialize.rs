//! Payload serializers.
//!
//! Both implementations are self-describing so `serde_json::Value` arguments
//! and results survive the trip unchanged.

use std::sync::Arc;

use crate::extension::ExtensionLoader;
use crate::protocol::{Result, RpcRequest, RpcResponse, SerializationKind};

pub trait Serializer: Send + Sync {
    fn serialize_request(&self, request: &RpcRequest) -> Result<Vec<u8>>;
    fn deserialize_request(&self, bytes: &[u8]) -> Result<RpcRequest>;
    fn serialize_response(&self, response: &RpcResponse) -> Result<Vec<u8>>;
    fn deserialize_response(&self, bytes: &[u8]) -> Result<RpcResponse>;
}

pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(request)?)
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<RpcRequest> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn serialize_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<RpcResponse> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub struct CborSerializer;

impl CborSerializer {
    fn to_vec<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)?;
        Ok(buf)
    }
}

impl Serializer for CborSerializer {
    fn serialize_request(&self, request: &RpcRequest) -> Result<Vec<u8>> {
        Self::to_vec(request)
    }

    fn deserialize_request(&self, bytes: &[u8]) -> Result<RpcRequest> {
        Ok(ciborium::from_reader(bytes)?)
    }

    fn serialize_response(&self, response: &RpcResponse) -> Result<Vec<u8>> {
        Self::to_vec(response)
    }

    fn deserialize_response(&self, bytes: &[u8]) -> Result<RpcResponse> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// Loader holding the built-in serializers, keyed by [`SerializationKind::name`].
pub fn builtin_serializers() -> ExtensionLoader<dyn Serializer> {
    ExtensionLoader::<dyn Serializer>::new("serializer")
        .register(SerializationKind::Json.name(), || {
            Ok(Arc::new(JsonSerializer) as Arc<dyn Serializer>)
        })
        .register(SerializationKind::Cbor.name(), || {
            Ok(Arc::new(CborSerializer) as Arc<dyn Serializer>)
        })
}

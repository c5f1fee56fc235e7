//! `keelrpc call`: a single request, routed through a directory server or
//! sent straight to a known endpoint.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use keelrpc_client::{ClientConfig, RpcClient};
use keelrpc_common::{CompressionKind, Endpoint, SerializationKind, ServiceIdentity};
use keelrpc_registry::{MemoryStore, RemoteStore, ServiceDirectory};

/// Where a call is sent.
#[derive(Debug, Clone, PartialEq)]
pub enum CallTarget {
    /// Discover providers through the directory server at this address.
    Directory(String),
    /// Skip discovery and call this endpoint.
    Endpoint(Endpoint),
}

/// A parsed `call` invocation.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub target: CallTarget,
    pub service: ServiceIdentity,
    pub operation: String,
    pub arg_types: Vec<String>,
    pub args: Vec<Value>,
    pub serializer: SerializationKind,
    pub compressor: CompressionKind,
    pub timeout: Duration,
}

/// Parses `--args` as a JSON array and checks it against `--arg-type`.
///
/// When no types are given every argument is typed `String`.
pub fn parse_call_args(args: &str, arg_types: Vec<String>) -> Result<(Vec<String>, Vec<Value>)> {
    let value: Value =
        serde_json::from_str(args).map_err(|e| anyhow::anyhow!("Invalid JSON in args: {}", e))?;
    let args = match value {
        Value::Array(items) => items,
        other => return Err(anyhow::anyhow!("Invalid args: expected a JSON array, got {}", other)),
    };

    if arg_types.is_empty() {
        let inferred = vec!["String".to_string(); args.len()];
        return Ok((inferred, args));
    }
    if arg_types.len() != args.len() {
        return Err(anyhow::anyhow!(
            "Invalid args: {} argument types for {} arguments",
            arg_types.len(),
            args.len()
        ));
    }
    Ok((arg_types, args))
}

/// Sends one request and returns the result.
///
/// An endpoint target is pre-registered in a throwaway in-memory directory
/// so the normal routing path is used either way.
pub async fn call_service(options: CallOptions) -> Result<Value> {
    let directory = match &options.target {
        CallTarget::Directory(addr) => ServiceDirectory::new(Arc::new(RemoteStore::new(addr.as_str()))),
        CallTarget::Endpoint(endpoint) => {
            let directory = ServiceDirectory::new(Arc::new(MemoryStore::new()));
            directory.register(&options.service, endpoint).await?;
            directory
        }
    };

    let config = ClientConfig::default()
        .with_serializer(options.serializer)
        .with_compressor(options.compressor)
        .with_request_timeout(options.timeout);
    let client = RpcClient::new(config, Arc::new(directory))?;

    let result = client
        .proxy(options.service)
        .call(&options.operation, options.arg_types, options.args)
        .await;
    client.shutdown();
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_args_infers_string_types() {
        let (types, args) = parse_call_args(r#"["a", "b"]"#, vec![]).unwrap();
        assert_eq!(types, vec!["String", "String"]);
        assert_eq!(args, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_parse_args_explicit_types() {
        let (types, args) = parse_call_args("[1, 2]", vec!["i64".into(), "i64".into()]).unwrap();
        assert_eq!(types, vec!["i64", "i64"]);
        assert_eq!(args, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_parse_args_rejects_bad_input() {
        let err = parse_call_args("{invalid", vec![]).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));

        let err = parse_call_args(r#"{"a": 1}"#, vec![]).unwrap_err();
        assert!(err.to_string().contains("JSON array"));

        let err = parse_call_args("[1]", vec!["i64".into(), "i64".into()]).unwrap_err();
        assert!(err.to_string().contains("2 argument types for 1 arguments"));
    }

    #[test]
    fn test_parse_args_empty() {
        let (types, args) = parse_call_args("[]", vec![]).unwrap();
        assert!(types.is_empty());
        assert!(args.is_empty());
    }
}

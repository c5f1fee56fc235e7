//! Explicit service registration: operations are plain closures keyed by
//! name and argument-type signature.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use keelrpc_common::{Result, ServiceIdentity};

pub type Operation = Arc<dyn Fn(Vec<Value>) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OperationKey {
    name: String,
    arg_types: Vec<String>,
}

/// A published service: its identity plus its operation table.
///
/// # Example
///
/// ```
/// use keelrpc_server::Service;
/// use serde_json::{json, Value};
///
/// let echo = Service::new("Echo::demo::1".parse().unwrap())
///     .operation("echo", &["String"], |args| Ok(args.into_iter().next().unwrap_or(Value::Null)));
///
/// let op = echo.find("echo", &["String".to_string()]).unwrap();
/// assert_eq!(op(vec![json!("hi")]).unwrap(), json!("hi"));
/// assert!(echo.find("echo", &[]).is_none());
/// ```
pub struct Service {
    identity: ServiceIdentity,
    operations: HashMap<OperationKey, Operation>,
}

impl Service {
    pub fn new(identity: ServiceIdentity) -> Self {
        Service {
            identity,
            operations: HashMap::new(),
        }
    }

    /// Adds an operation. Registering the same name and signature again
    /// replaces the earlier closure.
    pub fn operation<F>(mut self, name: impl Into<String>, arg_types: &[&str], f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let key = OperationKey {
            name: name.into(),
            arg_types: arg_types.iter().map(|t| t.to_string()).collect(),
        };
        self.operations.insert(key, Arc::new(f));
        self
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Exact match on name and argument types.
    pub fn find(&self, name: &str, arg_types: &[String]) -> Option<Operation> {
        let key = OperationKey {
            name: name.to_string(),
            arg_types: arg_types.to_vec(),
        };
        self.operations.get(&key).cloned()
    }

    /// `name(type, ...)` for every operation, sorted.
    pub fn signatures(&self) -> Vec<String> {
        let mut signatures: Vec<String> = self
            .operations
            .keys()
            .map(|key| format!("{}({})", key.name, key.arg_types.join(", ")))
            .collect();
        signatures.sort();
        signatures
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("identity", &self.identity)
            .field("operations", &self.signatures())
            .finish()
    }
}

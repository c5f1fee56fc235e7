//! Named, lazily created singletons for pluggable capabilities.
//!
//! Every pluggable concern (serializer, compressor, load balancer, directory
//! backend, transport) gets one [`ExtensionLoader`]. Implementations are
//! registered up front as `name -> factory`; the first `get_extension(name)`
//! runs the factory and every later call returns the same `Arc`.
//!
//! # Example
//!
//! ```
//! use keelrpc_common::extension::ExtensionLoader;
//! use std::sync::Arc;
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String { "hello".into() }
//! }
//!
//! let loader = ExtensionLoader::<dyn Greeter>::new("greeter")
//!     .register("english", || Ok(Arc::new(English) as Arc<dyn Greeter>));
//!
//! let first = loader.get_extension("english").unwrap();
//! let second = loader.get_extension("english").unwrap();
//! assert!(Arc::ptr_eq(&first, &second));
//! assert!(loader.get_extension("french").is_err());
//! ```

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{Result, RpcError};

type Factory<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;
type Holder<T> = Arc<Mutex<Option<Arc<T>>>>;

pub struct ExtensionLoader<T: ?Sized> {
    capability: &'static str,
    factories: HashMap<String, Factory<T>>,
    holders: RwLock<HashMap<String, Holder<T>>>,
}

impl<T: ?Sized> ExtensionLoader<T> {
    /// Creates an empty loader for the named capability.
    pub fn new(capability: &'static str) -> Self {
        ExtensionLoader {
            capability,
            factories: HashMap::new(),
            holders: RwLock::new(HashMap::new()),
        }
    }

    /// Registers an implementation under `name`.
    ///
    /// Registration happens while the loader is being built, before it is
    /// shared, so a name is bound to exactly one factory for the loader's
    /// lifetime. Registering the same name twice keeps the later factory.
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Returns the singleton registered under `name`, creating it on first use.
    ///
    /// Concurrent first calls for the same name run the factory once: the
    /// per-name holder is locked for the duration of instantiation and
    /// re-checked after the lock is taken.
    ///
    /// # Errors
    ///
    /// `RpcError::Configuration` if `name` is empty, unknown, or its factory
    /// fails (the factory's error is included in the message).
    pub fn get_extension(&self, name: &str) -> Result<Arc<T>> {
        if name.is_empty() {
            return Err(RpcError::Configuration(format!(
                "{} extension name must not be empty",
                self.capability
            )));
        }

        let factory = self.factories.get(name).ok_or_else(|| {
            RpcError::Configuration(format!(
                "no {} implementation named '{}' (known: {})",
                self.capability,
                name,
                self.names().join(", ")
            ))
        })?;

        let holder = self.holder(name);
        let mut slot = holder.lock();
        if let Some(instance) = slot.as_ref() {
            return Ok(Arc::clone(instance));
        }

        let instance = factory().map_err(|e| {
            RpcError::Configuration(format!(
                "failed to instantiate {} '{}': {}",
                self.capability, name, e
            ))
        })?;
        debug!(capability = self.capability, name, "instantiated extension");
        *slot = Some(Arc::clone(&instance));
        Ok(instance)
    }

    fn holder(&self, name: &str) -> Holder<T> {
        if let Some(holder) = self.holders.read().get(name) {
            return Arc::clone(holder);
        }
        let mut holders = self.holders.write();
        Arc::clone(
            holders
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(None))),
        )
    }
}

impl<T: ?Sized> std::fmt::Debug for ExtensionLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLoader")
            .field("capability", &self.capability)
            .field("names", &self.names())
            .finish()
    }
}

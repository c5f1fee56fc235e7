//! Service discovery and load balancing for keelrpc.
//!
//! - [`store`]: the hierarchical coordination store seam and the in-memory
//!   backend
//! - [`remote`]: a TCP directory server and the networked store client that
//!   lets separate processes share one directory
//! - [`directory`]: registration and cached, watch-refreshed lookup of
//!   service endpoints
//! - [`load_balancer`]: random and consistent-hash endpoint selection

pub mod directory;
pub mod load_balancer;
pub mod remote;
pub mod store;

use std::sync::Arc;

use keelrpc_common::extension::ExtensionLoader;

pub use directory::{EndpointSnapshot, ServiceDirectory, DEFAULT_ROOT};
pub use load_balancer::{
    builtin_load_balancers, ConsistentHashLoadBalance, HashRing, LoadBalance, RandomLoadBalance,
};
pub use remote::{RemoteStore, StoreServer, DEFAULT_DIRECTORY_ADDR, DIRECTORY_ADDR_ENV};
pub use store::{CoordinationStore, MemoryStore};

/// Loader holding the built-in directory backends.
///
/// - `memory`: created once per loader, so everything resolving it from the
///   same loader sees the same registrations
/// - `remote`: a [`RemoteStore`] for the server named by
///   `KEELRPC_DIRECTORY_ADDR`; it connects on first use
pub fn builtin_stores() -> ExtensionLoader<dyn CoordinationStore> {
    ExtensionLoader::<dyn CoordinationStore>::new("directory")
        .register("memory", || Ok(Arc::new(MemoryStore::new()) as Arc<dyn CoordinationStore>))
        .register("remote", || Ok(Arc::new(RemoteStore::from_env()) as Arc<dyn CoordinationStore>))
}

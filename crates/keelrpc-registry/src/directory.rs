use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keelrpc_common::{Endpoint, Result, RpcError, ServiceIdentity};

use crate::store::CoordinationStore;

/// Root path under which every service is registered.
pub const DEFAULT_ROOT: &str = "/keel-rpc";

static SNAPSHOT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Endpoints known for one service at one point in time.
///
/// Snapshots are immutable; a refresh builds a new one with a new
/// `version`, which is what the consistent-hash balancer keys its rings on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub version: u64,
    pub endpoints: Vec<Endpoint>,
}

impl EndpointSnapshot {
    /// Builds a snapshot with a fresh version. Endpoints are sorted and
    /// deduplicated.
    pub fn new(mut endpoints: Vec<Endpoint>) -> Self {
        endpoints.sort();
        endpoints.dedup();
        EndpointSnapshot {
            version: SNAPSHOT_VERSION.fetch_add(1, Ordering::Relaxed),
            endpoints,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}

type SnapshotCache = Arc<RwLock<HashMap<ServiceIdentity, Arc<EndpointSnapshot>>>>;

/// Registers this process's endpoints and looks up everyone else's.
///
/// Layout in the store: `<root>/<service identity>/<host:port>`.
///
/// Lookups are served from a local cache. The first lookup of a service
/// reads the store and installs a watch; later membership changes replace
/// the cached snapshot in the background. The cache is eventually
/// consistent and says nothing about whether an endpoint is alive.
pub struct ServiceDirectory {
    store: Arc<dyn CoordinationStore>,
    root: String,
    registered: Mutex<HashSet<String>>,
    cache: SnapshotCache,
    fetch_guards: Mutex<HashMap<ServiceIdentity, Arc<tokio::sync::Mutex<()>>>>,
    watch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceDirectory {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_root(store, DEFAULT_ROOT)
    }

    pub fn with_root(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> Self {
        let root = root.into().trim_end_matches('/').to_string();
        ServiceDirectory {
            store,
            root,
            registered: Mutex::new(HashSet::new()),
            cache: Arc::new(RwLock::new(HashMap::new())),
            fetch_guards: Mutex::new(HashMap::new()),
            watch_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn service_path(&self, identity: &ServiceIdentity) -> String {
        format!("{}/{}", self.root, identity)
    }

    pub fn endpoint_path(&self, identity: &ServiceIdentity, endpoint: &Endpoint) -> String {
        format!("{}/{}", self.service_path(identity), endpoint)
    }

    /// Publishes `endpoint` as a provider of `identity`.
    ///
    /// Paths already created by this directory are skipped without
    /// touching the store.
    ///
    /// # Errors
    ///
    /// `DirectoryUnavailable` if the store cannot be reached.
    pub async fn register(&self, identity: &ServiceIdentity, endpoint: &Endpoint) -> Result<()> {
        let path = self.endpoint_path(identity, endpoint);
        if self.registered.lock().contains(&path) {
            debug!(%path, "service already registered");
            return Ok(());
        }

        self.store.create_persistent(&path).await?;
        self.registered.lock().insert(path.clone());
        info!(service = %identity, %endpoint, %path, "registered service");
        Ok(())
    }

    /// Returns the endpoints currently known for `identity`.
    ///
    /// # Errors
    ///
    /// - `ServiceNotFound` if no endpoint is registered for the service
    /// - `DirectoryUnavailable` if the store cannot be reached on a cache miss
    pub async fn lookup(&self, identity: &ServiceIdentity) -> Result<Arc<EndpointSnapshot>> {
        if let Some(snapshot) = self.cached(identity) {
            return Self::non_empty(identity, snapshot);
        }

        let guard = self.fetch_guard(identity);
        let result = {
            let _fetching = guard.lock().await;
            match self.cached(identity) {
                Some(snapshot) => Ok(snapshot),
                None => self.fetch_and_watch(identity).await,
            }
        };
        self.release_fetch_guard(identity, guard);
        Self::non_empty(identity, result?)
    }

    async fn fetch_and_watch(&self, identity: &ServiceIdentity) -> Result<Arc<EndpointSnapshot>> {
        let path = self.service_path(identity);
        // Watch before reading so a change between the two is not lost.
        let changes = self.store.watch_children(&path).await?;
        let snapshot = fetch_snapshot(self.store.as_ref(), &path).await?;
        self.cache.write().insert(identity.clone(), Arc::clone(&snapshot));
        debug!(service = %identity, endpoints = snapshot.len(), "cached service endpoints");

        let task = tokio::spawn(refresh_on_change(
            Arc::clone(&self.store),
            Arc::clone(&self.cache),
            identity.clone(),
            path,
            changes,
        ));
        self.watch_tasks.lock().push(task);
        Ok(snapshot)
    }

    /// Removes every path this directory registered for `endpoint`.
    ///
    /// All matching paths are attempted even if one fails; the first
    /// failure is returned after the rest have been tried.
    pub async fn deregister(&self, endpoint: &Endpoint) -> Result<usize> {
        let suffix = format!("/{}", endpoint);
        let paths: Vec<String> = self
            .registered
            .lock()
            .iter()
            .filter(|path| path.ends_with(&suffix))
            .cloned()
            .collect();

        let mut removed = 0;
        let mut first_error = None;
        for path in paths {
            match self.store.delete(&path).await {
                Ok(()) => {
                    self.registered.lock().remove(&path);
                    removed += 1;
                    info!(%path, "deregistered service");
                }
                Err(e) => {
                    warn!(%path, error = %e, "failed to deregister service");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Paths registered through this directory, sorted.
    pub fn registered_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.registered.lock().iter().cloned().collect();
        paths.sort();
        paths
    }

    fn cached(&self, identity: &ServiceIdentity) -> Option<Arc<EndpointSnapshot>> {
        self.cache.read().get(identity).cloned()
    }

    fn fetch_guard(&self, identity: &ServiceIdentity) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.fetch_guards.lock().entry(identity.clone()).or_default())
    }

    fn release_fetch_guard(&self, identity: &ServiceIdentity, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self.fetch_guards.lock();
        let idle = guards
            .get(identity)
            .map_or(false, |current| Arc::ptr_eq(current, &guard) && Arc::strong_count(&guard) == 2);
        drop(guard);
        if idle {
            guards.remove(identity);
        }
    }

    fn non_empty(identity: &ServiceIdentity, snapshot: Arc<EndpointSnapshot>) -> Result<Arc<EndpointSnapshot>> {
        if snapshot.is_empty() {
            Err(RpcError::ServiceNotFound(format!("no endpoints registered for {}", identity)))
        } else {
            Ok(snapshot)
        }
    }
}

impl Drop for ServiceDirectory {
    fn drop(&mut self) {
        for task in self.watch_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn fetch_snapshot(store: &dyn CoordinationStore, path: &str) -> Result<Arc<EndpointSnapshot>> {
    let children = store.children(path).await?;
    let endpoints = children
        .iter()
        .filter_map(|child| match child.parse::<Endpoint>() {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(%path, %child, error = %e, "skipping malformed endpoint node");
                None
            }
        })
        .collect();
    Ok(Arc::new(EndpointSnapshot::new(endpoints)))
}

async fn refresh_on_change(
    store: Arc<dyn CoordinationStore>,
    cache: SnapshotCache,
    identity: ServiceIdentity,
    path: String,
    mut changes: tokio::sync::mpsc::UnboundedReceiver<()>,
) {
    while changes.recv().await.is_some() {
        // Coalesce bursts into one re-read.
        while changes.try_recv().is_ok() {}

        match fetch_snapshot(store.as_ref(), &path).await {
            Ok(snapshot) => {
                debug!(service = %identity, endpoints = snapshot.len(), version = snapshot.version, "refreshed service endpoints");
                cache.write().insert(identity.clone(), snapshot);
            }
            Err(e) => {
                warn!(service = %identity, error = %e, "keeping stale endpoints after failed refresh");
            }
        }
    }
    // Without a watch the cache would go stale; the next lookup re-reads.
    cache.write().remove(&identity);
    debug!(service = %identity, "service watch closed, dropped cached endpoints");
}

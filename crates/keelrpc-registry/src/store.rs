//! Hierarchical coordination store used as the service directory backend.
//!
//! Paths are `/`-separated and absolute. Nodes are persistent: they stay
//! until deleted. [`MemoryStore`] is the in-process backend; an external
//! backend plugs in by implementing [`CoordinationStore`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

use keelrpc_common::{Result, RpcError};

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Creates `path` and any missing parents. Creating an existing node
    /// succeeds.
    async fn create_persistent(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names (last segment only) of the direct children of `path`, sorted.
    /// A missing node has no children.
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Deletes `path` and everything below it. Deleting a missing node
    /// succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Subscribes to child changes under `path`. The receiver gets one
    /// message per addition or removal of a direct child, for as long as
    /// it is kept alive. The node does not have to exist yet.
    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<()>>;
}

#[derive(Default)]
struct StoreState {
    nodes: BTreeSet<String>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<()>>>,
}

/// In-process coordination store.
///
/// `set_available(false)` makes every call fail with
/// `RpcError::DirectoryUnavailable`, which is how an unreachable external
/// store is simulated.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new(StoreState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self, op: &str, path: &str) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RpcError::DirectoryUnavailable(format!(
                "coordination store unreachable during {} {}",
                op, path
            )))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') || path.contains("//") {
        return Err(RpcError::Configuration(format!("invalid store path '{}'", path)));
    }
    Ok(())
}

fn parent_of(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&path[..idx]),
    }
}

impl StoreState {
    fn notify(&mut self, parent: &str) {
        if let Some(senders) = self.watchers.get_mut(parent) {
            senders.retain(|tx| tx.send(()).is_ok());
            if senders.is_empty() {
                self.watchers.remove(parent);
            }
        }
    }

    fn descendants(&self, path: &str) -> Vec<String> {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|node| node.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn create_persistent(&self, path: &str) -> Result<()> {
        validate(path)?;
        self.check_available("create", path)?;

        let mut state = self.state.lock();
        let mut created = Vec::new();
        let mut end = 0;
        while end < path.len() {
            end = path[end + 1..].find('/').map(|i| i + end + 1).unwrap_or(path.len());
            let prefix = &path[..end];
            if state.nodes.insert(prefix.to_string()) {
                created.push(prefix.to_string());
            }
        }
        for node in &created {
            if let Some(parent) = parent_of(node) {
                state.notify(parent);
            }
        }
        debug!(path, created = created.len(), "created persistent node");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        validate(path)?;
        self.check_available("exists", path)?;
        Ok(self.state.lock().nodes.contains(path))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        validate(path)?;
        self.check_available("children", path)?;

        let state = self.state.lock();
        let prefix = format!("{}/", path);
        Ok(state
            .descendants(path)
            .into_iter()
            .filter_map(|node| {
                let name = &node[prefix.len()..];
                (!name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate(path)?;
        self.check_available("delete", path)?;

        let mut state = self.state.lock();
        for node in state.descendants(path) {
            state.nodes.remove(&node);
            if let Some(parent) = parent_of(&node) {
                state.notify(parent);
            }
        }
        if state.nodes.remove(path) {
            if let Some(parent) = parent_of(path) {
                state.notify(parent);
            }
            debug!(path, "deleted node");
        }
        Ok(())
    }

    async fn watch_children(&self, path: &str) -> Result<mpsc::UnboundedReceiver<()>> {
        validate(path)?;
        self.check_available("watch", path)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.entry(path.to_string()).or_default().push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_makes_parents() {
        let store = MemoryStore::new();
        store.create_persistent("/keel-rpc/Foo/10.0.0.1:9000").await.unwrap();

        assert!(store.exists("/keel-rpc").await.unwrap());
        assert!(store.exists("/keel-rpc/Foo").await.unwrap());
        assert_eq!(store.children("/keel-rpc").await.unwrap(), vec!["Foo"]);
        assert_eq!(store.children("/keel-rpc/Foo").await.unwrap(), vec!["10.0.0.1:9000"]);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = MemoryStore::new();
        store.create_persistent("/a/b").await.unwrap();
        store.create_persistent("/a/b").await.unwrap();
        assert_eq!(store.children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_children_of_missing_node_is_empty() {
        let store = MemoryStore::new();
        assert!(store.children("/nothing/here").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_children_excludes_grandchildren_and_siblings() {
        let store = MemoryStore::new();
        store.create_persistent("/r/svc/a:1").await.unwrap();
        store.create_persistent("/r/svc/b:2/deep").await.unwrap();
        store.create_persistent("/r/svc2/c:3").await.unwrap();
        assert_eq!(store.children("/r/svc").await.unwrap(), vec!["a:1", "b:2"]);
    }

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let store = MemoryStore::new();
        store.create_persistent("/r/svc/a:1").await.unwrap();
        store.delete("/r/svc").await.unwrap();
        assert!(!store.exists("/r/svc/a:1").await.unwrap());
        assert!(store.exists("/r").await.unwrap());
        store.delete("/r/svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_fires_on_child_changes() {
        let store = MemoryStore::new();
        let mut rx = store.watch_children("/r/svc").await.unwrap();

        store.create_persistent("/r/svc/a:1").await.unwrap();
        assert!(rx.try_recv().is_ok());

        store.create_persistent("/r/svc/a:1/nested").await.unwrap();
        assert!(rx.try_recv().is_err(), "grandchild must not notify");

        store.delete("/r/svc/a:1").await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.children("/r/svc").await,
            Err(RpcError::DirectoryUnavailable(_))
        ));
        assert!(matches!(
            store.create_persistent("/r/svc/a:1").await,
            Err(RpcError::DirectoryUnavailable(_))
        ));
        store.set_available(true);
        assert!(store.children("/r/svc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_paths() {
        let store = MemoryStore::new();
        for bad in ["", "/", "relative", "/trailing/", "/double//slash"] {
            assert!(
                matches!(store.create_persistent(bad).await, Err(RpcError::Configuration(_))),
                "{}",
                bad
            );
        }
    }
}

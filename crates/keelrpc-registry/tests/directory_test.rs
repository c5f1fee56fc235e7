//! Directory + Load Balancer Integration Tests
//!
//! Registers endpoints through one directory, discovers them through
//! another sharing the same store, and routes requests across them.

use keelrpc_common::{Endpoint, RpcError, RpcRequest, ServiceIdentity};
use keelrpc_registry::{
    builtin_load_balancers, builtin_stores, CoordinationStore, MemoryStore, RemoteStore,
    ServiceDirectory, StoreServer,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn identity() -> ServiceIdentity {
    "Foo::g1::v1".parse().unwrap()
}

async fn wait_for_count(directory: &ServiceDirectory, count: usize) {
    for _ in 0..200 {
        match directory.lookup(&identity()).await {
            Ok(snapshot) if snapshot.len() == count => return,
            _ => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    panic!("directory never reached {} endpoints", count);
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_register_and_lookup_single_endpoint() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let server_side = ServiceDirectory::new(Arc::clone(&store));
    let client_side = ServiceDirectory::new(Arc::clone(&store));

    server_side
        .register(&identity(), &"10.0.0.1:9000".parse().unwrap())
        .await
        .unwrap();

    let snapshot = client_side.lookup(&identity()).await.unwrap();
    let found: HashSet<_> = snapshot.endpoints.iter().cloned().collect();
    assert_eq!(found, HashSet::from([Endpoint::new("10.0.0.1", 9000)]));
}

#[tokio::test]
async fn test_groups_and_versions_are_separate_services() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let directory = ServiceDirectory::new(store);
    let v2: ServiceIdentity = "Foo::g1::v2".parse().unwrap();

    directory.register(&identity(), &Endpoint::new("10.0.0.1", 9000)).await.unwrap();
    directory.register(&v2, &Endpoint::new("10.0.0.2", 9000)).await.unwrap();

    assert_eq!(directory.lookup(&identity()).await.unwrap().endpoints, vec![Endpoint::new("10.0.0.1", 9000)]);
    assert_eq!(directory.lookup(&v2).await.unwrap().endpoints, vec![Endpoint::new("10.0.0.2", 9000)]);
}

#[tokio::test]
async fn test_builtin_memory_store_is_a_singleton() {
    let stores = builtin_stores();
    let a = stores.get_extension("memory").unwrap();
    let b = stores.get_extension("memory").unwrap();

    ServiceDirectory::new(a)
        .register(&identity(), &Endpoint::new("10.0.0.1", 9000))
        .await
        .unwrap();
    assert_eq!(ServiceDirectory::new(b).lookup(&identity()).await.unwrap().len(), 1);
    assert!(stores.get_extension("remote").is_ok());
    assert!(matches!(stores.get_extension("zookeeper"), Err(RpcError::Configuration(_))));
}

#[tokio::test]
async fn test_shutdown_deregistration_is_observed_by_clients() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let server_a = ServiceDirectory::new(Arc::clone(&store));
    let server_b = ServiceDirectory::new(Arc::clone(&store));
    let client = ServiceDirectory::new(Arc::clone(&store));
    let a = Endpoint::new("10.0.0.1", 9000);
    let b = Endpoint::new("10.0.0.2", 9000);

    server_a.register(&identity(), &a).await.unwrap();
    server_b.register(&identity(), &b).await.unwrap();
    wait_for_count(&client, 2).await;

    server_a.deregister(&a).await.unwrap();
    wait_for_count(&client, 1).await;
    assert_eq!(client.lookup(&identity()).await.unwrap().endpoints, vec![b.clone()]);

    server_b.deregister(&b).await.unwrap();
    for _ in 0..200 {
        if matches!(client.lookup(&identity()).await, Err(RpcError::ServiceNotFound(_))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("empty service should be reported as not found");
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_consistent_hash_routes_same_args_to_same_endpoint() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let directory = ServiceDirectory::new(store);
    for port in 9000..9005 {
        directory.register(&identity(), &Endpoint::new("10.0.0.1", port)).await.unwrap();
    }

    let balancer = builtin_load_balancers().get_extension("consistent_hash").unwrap();
    let snapshot = directory.lookup(&identity()).await.unwrap();

    let mut targets = HashSet::new();
    for user in 0..200 {
        let request = RpcRequest::new(&identity(), "get").with_arg("i64", json!(user));
        let first = balancer.select(&snapshot, &request).unwrap();
        let retry = RpcRequest::new(&identity(), "get").with_arg("i64", json!(user));
        assert_eq!(balancer.select(&snapshot, &retry).unwrap(), first);
        targets.insert(first);
    }
    assert!(targets.len() > 1, "200 keys should spread over several endpoints");
}

// ============================================================================
// Shared directory over TCP
// ============================================================================

async fn start_directory() -> (Arc<StoreServer>, String) {
    let server = Arc::new(StoreServer::bind("127.0.0.1:0").await.unwrap());
    let addr = server.local_addr().unwrap().to_string();
    let running = Arc::clone(&server);
    tokio::spawn(async move { running.run().await });
    (server, addr)
}

fn remote_directory(addr: &str) -> ServiceDirectory {
    ServiceDirectory::new(Arc::new(RemoteStore::new(addr).with_request_timeout(Duration::from_millis(500))))
}

#[tokio::test]
async fn test_remote_directory_shares_registrations() {
    let (_server, addr) = start_directory().await;
    let publisher_a = remote_directory(&addr);
    let publisher_b = remote_directory(&addr);
    let client = remote_directory(&addr);
    let a = Endpoint::new("10.0.0.1", 9000);
    let b = Endpoint::new("10.0.0.2", 9000);

    publisher_a.register(&identity(), &a).await.unwrap();
    assert_eq!(client.lookup(&identity()).await.unwrap().endpoints, vec![a.clone()]);

    publisher_b.register(&identity(), &b).await.unwrap();
    wait_for_count(&client, 2).await;

    publisher_a.deregister(&a).await.unwrap();
    wait_for_count(&client, 1).await;
    assert_eq!(client.lookup(&identity()).await.unwrap().endpoints, vec![b]);
}

#[tokio::test]
async fn test_remote_directory_outage_is_unavailable() {
    let (server, addr) = start_directory().await;
    let publisher = remote_directory(&addr);
    let client = remote_directory(&addr);
    publisher.register(&identity(), &Endpoint::new("10.0.0.1", 9000)).await.unwrap();
    assert_eq!(client.lookup(&identity()).await.unwrap().len(), 1);

    // Losing the watch drops the cached endpoints, so the outage surfaces.
    server.shutdown();
    for _ in 0..50 {
        if matches!(client.lookup(&identity()).await, Err(RpcError::DirectoryUnavailable(_))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("lookup kept succeeding after the directory went away");
}

// End-to-end tests for keelrpc-server
//
// These tests bind a real TCP server, publish services through a shared
// in-memory directory, and call them through an RpcClient.

use keelrpc_client::{ClientConfig, RpcClient};
use keelrpc_common::{CompressionKind, RpcError, RpcRequest, SerializationKind, ServiceIdentity};
use keelrpc_registry::{CoordinationStore, MemoryStore, RemoteStore, ServiceDirectory, StoreServer};
use keelrpc_server::{RpcServer, ServerConfig, Service};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn echo_identity() -> ServiceIdentity {
    "Echo::g1::v1".parse().unwrap()
}

fn echo_service() -> Service {
    Service::new(echo_identity())
        .operation("echo", &["String"], |args| Ok(args.into_iter().next().unwrap_or(Value::Null)))
        .operation("add", &["i64", "i64"], |args| {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        })
        .operation("reset", &[], |_| Ok(Value::Null))
}

async fn start_server(
    store: &Arc<dyn CoordinationStore>,
    config: ServerConfig,
    service: Service,
) -> (Arc<RpcServer>, tokio::task::JoinHandle<()>) {
    let directory = Arc::new(ServiceDirectory::new(Arc::clone(store)));
    let server = Arc::new(
        RpcServer::bind(config.with_bind("127.0.0.1:0"), directory)
            .await
            .unwrap(),
    );
    server.publish(service).await.unwrap();

    let running = Arc::clone(&server);
    let task = tokio::spawn(async move {
        running.run().await.unwrap();
    });
    (server, task)
}

fn client(store: &Arc<dyn CoordinationStore>, config: ClientConfig) -> RpcClient {
    RpcClient::new(config, Arc::new(ServiceDirectory::new(Arc::clone(store)))).unwrap()
}

// ============================================================================
// Calls
// ============================================================================

#[tokio::test]
async fn test_echo_through_proxy() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (_server, _task) = start_server(&store, ServerConfig::default(), echo_service()).await;

    let client = client(&store, ClientConfig::default());
    let echo = client.proxy(echo_identity());

    let result = echo.call("echo", vec!["String".into()], vec![json!("hi")]).await.unwrap();
    assert_eq!(result, json!("hi"));

    let sum = echo
        .call("add", vec!["i64".into(), "i64".into()], vec![json!(2), json!(40)])
        .await
        .unwrap();
    assert_eq!(sum, json!(42));
}

#[tokio::test]
async fn test_every_codec_combination() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (_server, _task) = start_server(&store, ServerConfig::default(), echo_service()).await;

    for serializer in SerializationKind::ALL {
        for compressor in CompressionKind::ALL {
            let config = ClientConfig::default()
                .with_serializer(serializer)
                .with_compressor(compressor);
            let client = client(&store, config);
            let payload = json!({ "text": "x".repeat(4096), "codec": serializer.name() });
            let result = client
                .proxy(echo_identity())
                .call("echo", vec!["String".into()], vec![payload.clone()])
                .await
                .unwrap();
            assert_eq!(result, payload, "{} + {}", serializer, compressor);

            let void = client
                .proxy(echo_identity())
                .call("reset", vec![], vec![])
                .await
                .unwrap();
            assert_eq!(void, Value::Null, "{} + {}", serializer, compressor);
        }
    }
}

#[tokio::test]
async fn test_concurrent_calls_share_one_connection() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (_server, _task) = start_server(&store, ServerConfig::default(), echo_service()).await;
    let client = client(&store, ClientConfig::default());

    let calls = (0..50).map(|i| {
        let echo = client.proxy(echo_identity());
        async move { echo.call("echo", vec!["String".into()], vec![json!(i)]).await }
    });
    let results = futures::future::join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!(i));
    }
    assert!(client.pending().is_empty());
}

#[tokio::test]
async fn test_unknown_operation_is_invocation_error() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (_server, _task) = start_server(&store, ServerConfig::default(), echo_service()).await;
    let client = client(&store, ClientConfig::default());

    let err = client
        .proxy(echo_identity())
        .call("shout", vec!["String".into()], vec![json!("hi")])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Invocation(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_unpublished_service_is_not_found() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (_server, _task) = start_server(&store, ServerConfig::default(), echo_service()).await;
    let client = client(&store, ClientConfig::default());

    let err = client
        .call(RpcRequest::new(&"Ghost::g1::v1".parse().unwrap(), "echo"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::ServiceNotFound(_)));
}

#[tokio::test]
async fn test_slow_operation_times_out() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let slow = Service::new("Slow".parse().unwrap()).operation("nap", &[], |_| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(json!("late"))
    });
    let (_server, _task) = start_server(&store, ServerConfig::default(), slow).await;
    let client = client(
        &store,
        ClientConfig::default().with_request_timeout(Duration::from_millis(50)),
    );

    let err = client.call(RpcRequest::new(&"Slow".parse().unwrap(), "nap")).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(50)));
    assert!(client.pending().is_empty());
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_idle_close() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let config = ServerConfig::default().with_idle_timeout(Duration::from_millis(100));
    let (server, _task) = start_server(&store, config, echo_service()).await;
    let client = client(&store, ClientConfig::default());
    let echo = client.proxy(echo_identity());

    assert_eq!(echo.call("echo", vec!["String".into()], vec![json!(1)]).await.unwrap(), json!(1));

    // The server drops the silent connection; the next call dials again.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(echo.call("echo", vec!["String".into()], vec![json!(2)]).await.unwrap(), json!(2));
    assert_eq!(server.connections_accepted(), 2);
}

#[tokio::test]
async fn test_heartbeats_keep_connection_open() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let service = Service::new(echo_identity()).operation("count", &[], move |_| {
        Ok(json!(counter.fetch_add(1, Ordering::SeqCst)))
    });
    let config = ServerConfig::default().with_idle_timeout(Duration::from_millis(300));
    let (server, _task) = start_server(&store, config, service).await;

    let client = client(
        &store,
        ClientConfig::default().with_heartbeat_interval(Duration::from_millis(50)),
    );
    let proxy = client.proxy(echo_identity());
    proxy.call("count", vec![], vec![]).await.unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(proxy.call("count", vec![], vec![]).await.unwrap(), json!(1));
    assert_eq!(server.connections_accepted(), 1);
}

#[tokio::test]
async fn test_shutdown_deregisters_and_stops_accepting() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let (server, task) = start_server(&store, ServerConfig::default(), echo_service()).await;
    let observer = ServiceDirectory::new(Arc::clone(&store));
    assert_eq!(observer.lookup(&echo_identity()).await.unwrap().endpoints, vec![server.endpoint().clone()]);

    server.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("accept loop did not stop")
        .unwrap();

    let fresh = ServiceDirectory::new(Arc::clone(&store));
    assert!(matches!(
        fresh.lookup(&echo_identity()).await,
        Err(RpcError::ServiceNotFound(_))
    ));
}

#[tokio::test]
async fn test_two_servers_share_the_load() {
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let hits_a = Arc::new(AtomicUsize::new(0));
    let hits_b = Arc::new(AtomicUsize::new(0));

    let counting = |hits: Arc<AtomicUsize>| {
        Service::new(echo_identity()).operation("echo", &["String"], move |args| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        })
    };
    let (_a, _ta) = start_server(&store, ServerConfig::default(), counting(Arc::clone(&hits_a))).await;
    let (_b, _tb) = start_server(&store, ServerConfig::default(), counting(Arc::clone(&hits_b))).await;

    let client = client(&store, ClientConfig::default());
    let echo = client.proxy(echo_identity());
    for i in 0..64 {
        let arg = json!(format!("key-{}", i));
        assert_eq!(echo.call("echo", vec!["String".into()], vec![arg.clone()]).await.unwrap(), arg);
    }

    assert_eq!(hits_a.load(Ordering::SeqCst) + hits_b.load(Ordering::SeqCst), 64);
    assert!(hits_a.load(Ordering::SeqCst) > 0);
    assert!(hits_b.load(Ordering::SeqCst) > 0);
}

// ============================================================================
// Directory server
// ============================================================================

#[tokio::test]
async fn test_discovery_through_directory_server() {
    let directory = Arc::new(StoreServer::bind("127.0.0.1:0").await.unwrap());
    let addr = directory.local_addr().unwrap().to_string();
    let running = Arc::clone(&directory);
    tokio::spawn(async move { running.run().await });

    // Server and client each have their own connection to the directory.
    let server_store: Arc<dyn CoordinationStore> = Arc::new(RemoteStore::new(addr.clone()));
    let client_store: Arc<dyn CoordinationStore> = Arc::new(RemoteStore::new(addr));
    let (server, task) = start_server(&server_store, ServerConfig::default(), echo_service()).await;
    let client = client(
        &client_store,
        ClientConfig::default().with_request_timeout(Duration::from_millis(500)),
    );
    let echo = client.proxy(echo_identity());

    assert_eq!(echo.call("echo", vec!["String".into()], vec![json!("across")]).await.unwrap(), json!("across"));

    server.shutdown().await.unwrap();
    task.await.unwrap();
    drop(server);
    for _ in 0..200 {
        let result = echo.call("echo", vec!["String".into()], vec![json!("gone")]).await;
        if matches!(result, Err(RpcError::ServiceNotFound(_))) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client never saw the server deregister");
}

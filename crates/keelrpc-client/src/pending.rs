//! Outstanding requests awaiting a response, keyed by request id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use keelrpc_common::{RequestId, Result, RpcError, RpcResponse};

struct PendingEntry {
    connection_id: u64,
    tx: oneshot::Sender<Result<RpcResponse>>,
}

/// Awaitable handle for one request's response.
///
/// Resolves to the server's [`RpcResponse`] (success or failure code), or
/// to an error if the request never made it: write failure, dropped
/// connection, timeout eviction or client shutdown.
pub struct ResponseHandle {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<RpcResponse>>,
}

impl ResponseHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Future for ResponseHandle {
    type Output = Result<RpcResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let request_id = self.request_id.clone();
        Pin::new(&mut self.rx).poll(cx).map(|outcome| {
            outcome.unwrap_or_else(|_| {
                Err(RpcError::Correlation(format!(
                    "request {} was dropped without an outcome",
                    request_id
                )))
            })
        })
    }
}

/// Table of requests sent but not yet answered.
///
/// Every entry is completed exactly once: by [`resolve`](Self::resolve)
/// when the response arrives, or by one of the `fail*` methods. Whichever
/// removes the entry from the map first wins.
#[derive(Default)]
pub struct PendingRequests {
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an entry and returns the handle the caller awaits.
    ///
    /// `connection_id` records which connection the request goes out on, so
    /// the entry can be failed if that connection dies.
    ///
    /// # Errors
    ///
    /// `Correlation` if `request_id` is already pending.
    pub fn register(&self, request_id: RequestId, connection_id: u64) -> Result<ResponseHandle> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock();
        if entries.contains_key(&request_id) {
            return Err(RpcError::Correlation(format!(
                "request id {} is already pending",
                request_id
            )));
        }
        entries.insert(request_id.clone(), PendingEntry { connection_id, tx });
        Ok(ResponseHandle { request_id, rx })
    }

    /// Completes the entry matching `response.request_id`.
    ///
    /// # Errors
    ///
    /// `Correlation` if no entry exists, meaning a stale or duplicate
    /// response. The caller logs it and keeps the connection.
    pub fn resolve(&self, response: RpcResponse) -> Result<()> {
        let entry = self.entries.lock().remove(&response.request_id);
        match entry {
            Some(entry) => {
                let request_id = response.request_id.clone();
                if entry.tx.send(Ok(response)).is_err() {
                    debug!(%request_id, "response arrived after caller gave up");
                }
                Ok(())
            }
            None => Err(RpcError::Correlation(format!(
                "no pending request {} (code {})",
                response.request_id, response.code
            ))),
        }
    }

    /// Completes one entry with `error`. Returns whether it was pending.
    pub fn fail(&self, request_id: &str, error: RpcError) -> bool {
        let entry = self.entries.lock().remove(request_id);
        match entry {
            Some(entry) => {
                warn!(%request_id, error = %error, "request failed before a response arrived");
                let _ = entry.tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every entry sent on `connection_id`. Returns how many.
    pub fn fail_connection(&self, connection_id: u64, reason: &str) -> usize {
        let failed: Vec<(RequestId, PendingEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.connection_id == connection_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let count = failed.len();
        for (request_id, entry) in failed {
            debug!(%request_id, connection_id, reason, "failing request on closed connection");
            let _ = entry
                .tx
                .send(Err(RpcError::Connection(reason.to_string())));
        }
        if count > 0 {
            warn!(connection_id, count, reason, "failed pending requests of closed connection");
        }
        count
    }

    /// Fails everything still pending. Returns how many.
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(RpcError::Connection(reason.to_string())));
        }
        count
    }

    /// Drops an entry without completing it, for callers that stopped
    /// waiting. Returns whether it was pending.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.entries.lock().remove(request_id).is_some()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries.lock().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_then_resolve() {
        let pending = PendingRequests::new();
        let handle = pending.register("r1".into(), 1).unwrap();
        assert_eq!(handle.request_id(), "r1");

        pending.resolve(RpcResponse::success("r1".into(), json!("hi"))).unwrap();
        let response = handle.await.unwrap();
        assert_eq!(response.data, json!("hi"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_register_is_rejected() {
        let pending = PendingRequests::new();
        let _handle = pending.register("r1".into(), 1).unwrap();
        assert!(matches!(
            pending.register("r1".into(), 2),
            Err(RpcError::Correlation(_))
        ));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_is_correlation_error() {
        let pending = PendingRequests::new();
        assert!(matches!(
            pending.resolve(RpcResponse::success("ghost".into(), json!(1))),
            Err(RpcError::Correlation(_))
        ));
    }

    #[tokio::test]
    async fn test_second_resolve_is_rejected() {
        let pending = PendingRequests::new();
        let handle = pending.register("r1".into(), 1).unwrap();
        pending.resolve(RpcResponse::success("r1".into(), json!(1))).unwrap();
        assert!(pending.resolve(RpcResponse::success("r1".into(), json!(2))).is_err());
        assert_eq!(handle.await.unwrap().data, json!(1));
    }

    #[tokio::test]
    async fn test_fail_completes_with_error() {
        let pending = PendingRequests::new();
        let handle = pending.register("r1".into(), 1).unwrap();
        assert!(pending.fail("r1", RpcError::Connection("broken pipe".into())));
        assert!(!pending.fail("r1", RpcError::Connection("again".into())));
        assert!(matches!(handle.await, Err(RpcError::Connection(_))));
    }

    #[tokio::test]
    async fn test_fail_connection_only_touches_that_connection() {
        let pending = PendingRequests::new();
        let a = pending.register("a".into(), 1).unwrap();
        let b = pending.register("b".into(), 2).unwrap();
        let c = pending.register("c".into(), 1).unwrap();

        assert_eq!(pending.fail_connection(1, "peer closed"), 2);
        assert!(matches!(a.await, Err(RpcError::Connection(_))));
        assert!(matches!(c.await, Err(RpcError::Connection(_))));
        assert!(pending.contains("b"));

        pending.resolve(RpcResponse::fail("b".into(), "nope")).unwrap();
        assert_eq!(b.await.unwrap().code, 500);
    }

    #[tokio::test]
    async fn test_fail_all_and_cancel() {
        let pending = PendingRequests::new();
        let a = pending.register("a".into(), 1).unwrap();
        let b = pending.register("b".into(), 2).unwrap();

        assert!(pending.cancel("b"));
        assert!(matches!(b.await, Err(RpcError::Correlation(_))));
        assert_eq!(pending.fail_all("shutdown"), 1);
        assert!(matches!(a.await, Err(RpcError::Connection(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_resolve_each_exactly_once() {
        let pending = Arc::new(PendingRequests::new());
        let mut waiters = Vec::new();
        let mut resolvers = Vec::new();

        for task in 0..8 {
            let ids: Vec<String> = (0..250).map(|i| format!("{}-{}", task, i)).collect();
            let handles: Vec<_> = ids
                .iter()
                .map(|id| pending.register(id.clone(), task).unwrap())
                .collect();
            waiters.push(tokio::spawn(async move {
                let mut resolved = 0;
                for (handle, id) in handles.into_iter().zip(ids.iter()) {
                    let response = handle.await.unwrap();
                    assert_eq!(&response.request_id, id);
                    assert_eq!(response.data, json!(id));
                    resolved += 1;
                }
                resolved
            }));

            let pending = Arc::clone(&pending);
            resolvers.push(tokio::spawn(async move {
                let mut accepted = 0;
                for i in (0..250).rev() {
                    let id = format!("{}-{}", task, i);
                    // Every id is resolved twice; only the first may land.
                    for _ in 0..2 {
                        if pending.resolve(RpcResponse::success(id.clone(), json!(id))).is_ok() {
                            accepted += 1;
                        }
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            }));
        }

        let mut total_accepted = 0;
        for resolver in resolvers {
            total_accepted += resolver.await.unwrap();
        }
        let mut total_resolved = 0;
        for waiter in waiters {
            total_resolved += waiter.await.unwrap();
        }

        assert_eq!(total_accepted, 2000);
        assert_eq!(total_resolved, 2000);
        assert!(pending.is_empty());
    }
}

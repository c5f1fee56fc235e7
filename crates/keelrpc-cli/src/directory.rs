//! `keelrpc directory`: runs the shared directory server, plus the store
//! selection used by `serve` and `call`.

use anyhow::Result;
use std::sync::Arc;

use keelrpc_registry::{CoordinationStore, MemoryStore, RemoteStore, StoreServer, DIRECTORY_ADDR_ENV};

/// The directory address from `--directory`, else `KEELRPC_DIRECTORY_ADDR`.
pub fn directory_addr(flag: Option<String>) -> Option<String> {
    flag.or_else(|| std::env::var(DIRECTORY_ADDR_ENV).ok())
}

/// A remote store for `addr`, or a process-local one when there is none.
pub fn store_for(addr: Option<&str>) -> Arc<dyn CoordinationStore> {
    match addr {
        Some(addr) => Arc::new(RemoteStore::new(addr)),
        None => Arc::new(MemoryStore::new()),
    }
}

/// Serves the directory on `bind` until Ctrl-C.
pub async fn run_directory(bind: &str) -> Result<()> {
    let server = Arc::new(StoreServer::bind(bind).await?);
    tracing::info!("Directory listening on {}", server.local_addr()?);

    let running = Arc::clone(&server);
    let accept_loop = tokio::spawn(async move { running.run().await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl-C: {}", e))?;
    tracing::info!("Shutting down directory");

    server.shutdown();
    accept_loop.await??;
    Ok(())
}

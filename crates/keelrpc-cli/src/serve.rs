//! `keelrpc serve`: runs a server exposing the built-in echo service.

use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use keelrpc_common::{Endpoint, RpcError, ServiceIdentity};
use keelrpc_registry::ServiceDirectory;
use keelrpc_server::{RpcServer, ServerConfig, Service};

use crate::directory::store_for;

/// Options for [`run_serve`], already validated.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub bind: String,
    pub advertise: Option<Endpoint>,
    pub idle_timeout: Duration,
    pub workers: Option<usize>,
    pub service: ServiceIdentity,
    /// Directory server to publish into; `None` keeps the directory local.
    pub directory: Option<String>,
}

/// The demo service: `echo(String)` returns its argument, `concat(String,
/// String)` joins two strings.
pub fn echo_service(identity: ServiceIdentity) -> Service {
    Service::new(identity)
        .operation("echo", &["String"], |args| {
            args.into_iter()
                .next()
                .ok_or_else(|| RpcError::Invocation("echo expects one argument".into()))
        })
        .operation("concat", &["String", "String"], |args| {
            let joined: String = args
                .iter()
                .map(|arg| match arg {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();
            Ok(Value::String(joined))
        })
}

/// Builds the server configuration.
///
/// Advertised endpoint priority: `--advertise` flag, then
/// `KEELRPC_ADVERTISE_ADDR`, then the bound address.
pub fn server_config(options: &ServeOptions) -> Result<ServerConfig> {
    let mut config = ServerConfig::default()
        .with_bind(options.bind.clone())
        .with_idle_timeout(options.idle_timeout)
        .with_env_overrides()?;
    if let Some(endpoint) = &options.advertise {
        config = config.with_advertise(endpoint.clone());
    }
    if let Some(workers) = options.workers {
        config = config.with_workers(workers);
    }
    Ok(config)
}

/// Binds, publishes the echo service and serves until Ctrl-C.
///
/// With a directory server the service is discoverable by name
/// (`keelrpc call Echo echo`). Without one the directory is process-local
/// and callers need the endpoint (`keelrpc call Echo echo -e <endpoint>`).
pub async fn run_serve(options: ServeOptions) -> Result<()> {
    let config = server_config(&options)?;
    match &options.directory {
        Some(addr) => tracing::info!("Publishing to directory at {}", addr),
        None => tracing::info!("No directory configured, publishing locally"),
    }
    let directory = Arc::new(ServiceDirectory::new(store_for(options.directory.as_deref())));
    let server = Arc::new(RpcServer::bind(config, directory).await?);

    server.publish(echo_service(options.service.clone())).await?;
    tracing::info!("Serving {} on {}", options.service, server.local_addr()?);
    tracing::info!("Advertised endpoint: {}", server.endpoint());

    let running = Arc::clone(&server);
    let accept_loop = tokio::spawn(async move { running.run().await });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to listen for Ctrl-C: {}", e))?;
    tracing::info!("Shutting down");

    server.shutdown().await?;
    accept_loop.await??;
    Ok(())
}

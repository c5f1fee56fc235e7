use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use keelrpc_common::{Endpoint, Result, RpcError, ServiceIdentity};
use keelrpc_registry::ServiceDirectory;

use crate::service::Service;

/// Local table of published services, plus their directory registration.
pub struct ServiceProvider {
    services: RwLock<HashMap<ServiceIdentity, Arc<Service>>>,
    directory: Arc<ServiceDirectory>,
}

impl ServiceProvider {
    pub fn new(directory: Arc<ServiceDirectory>) -> Self {
        ServiceProvider {
            services: RwLock::new(HashMap::new()),
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<ServiceDirectory> {
        &self.directory
    }

    /// Adds `service` to the local table. Returns `false` and keeps the
    /// existing instance if the identity is already present.
    pub fn add_service(&self, service: Service) -> bool {
        let mut services = self.services.write();
        let identity = service.identity().clone();
        if services.contains_key(&identity) {
            debug!(service = %identity, "service already added");
            return false;
        }
        info!(service = %identity, operations = ?service.signatures(), "added service");
        services.insert(identity, Arc::new(service));
        true
    }

    /// # Errors
    ///
    /// `ServiceNotFound` if nothing was added under `identity`.
    pub fn get_service(&self, identity: &ServiceIdentity) -> Result<Arc<Service>> {
        self.services
            .read()
            .get(identity)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(identity.to_string()))
    }

    /// Adds `service` locally and registers `endpoint` for it in the
    /// directory.
    pub async fn publish_service(&self, service: Service, endpoint: &Endpoint) -> Result<()> {
        let identity = service.identity().clone();
        self.add_service(service);
        self.directory.register(&identity, endpoint).await
    }

    pub fn identities(&self) -> Vec<ServiceIdentity> {
        let mut identities: Vec<ServiceIdentity> = self.services.read().keys().cloned().collect();
        identities.sort();
        identities
    }
}

use md5::{Digest, Md5};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use keelrpc_common::extension::ExtensionLoader;
use keelrpc_common::{Endpoint, RpcRequest};

use crate::directory::EndpointSnapshot;

/// Virtual nodes per endpoint on the hash ring.
pub const VIRTUAL_NODES: usize = 160;

/// Picks one endpoint out of a snapshot for a request.
pub trait LoadBalance: Send + Sync {
    /// Returns `None` for an empty snapshot. A single candidate is
    /// returned without consulting the strategy.
    fn select(&self, snapshot: &EndpointSnapshot, request: &RpcRequest) -> Option<Endpoint> {
        match snapshot.endpoints.as_slice() {
            [] => None,
            [only] => Some(only.clone()),
            _ => self.do_select(snapshot, request),
        }
    }

    /// Strategy proper; only called with two or more candidates.
    fn do_select(&self, snapshot: &EndpointSnapshot, request: &RpcRequest) -> Option<Endpoint>;
}

/// Uniform random choice.
pub struct RandomLoadBalance;

impl LoadBalance for RandomLoadBalance {
    fn do_select(&self, snapshot: &EndpointSnapshot, _request: &RpcRequest) -> Option<Endpoint> {
        snapshot.endpoints.choose(&mut rand::thread_rng()).cloned()
    }
}

/// Consistent hashing over MD5 with [`VIRTUAL_NODES`] positions per endpoint.
///
/// Rings are cached per service identity and reused for as long as the
/// directory hands out the same snapshot version.
#[derive(Default)]
pub struct ConsistentHashLoadBalance {
    rings: RwLock<HashMap<String, Arc<HashRing>>>,
}

impl ConsistentHashLoadBalance {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring_for(&self, service: &str, snapshot: &EndpointSnapshot) -> Arc<HashRing> {
        if let Some(ring) = self.rings.read().get(service) {
            if ring.snapshot_version == snapshot.version {
                return Arc::clone(ring);
            }
        }

        let ring = Arc::new(HashRing::new(snapshot));
        debug!(service, version = snapshot.version, positions = ring.len(), "rebuilt hash ring");
        self.rings.write().insert(service.to_string(), Arc::clone(&ring));
        ring
    }
}

impl LoadBalance for ConsistentHashLoadBalance {
    fn do_select(&self, snapshot: &EndpointSnapshot, request: &RpcRequest) -> Option<Endpoint> {
        let service = request.service_identity().to_string();
        let ring = self.ring_for(&service, snapshot);
        ring.select(&selection_key(&service, request)).cloned()
    }
}

/// `service identity + stringified arguments`, the text hashed to find a
/// request's ring position.
pub fn selection_key(service: &str, request: &RpcRequest) -> String {
    let mut key = String::from(service);
    for arg in &request.args {
        key.push_str(&arg.to_string());
    }
    key
}

/// Sorted map of ring position to endpoint, built from one snapshot.
pub struct HashRing {
    snapshot_version: u64,
    positions: BTreeMap<u32, Endpoint>,
}

impl HashRing {
    pub fn new(snapshot: &EndpointSnapshot) -> Self {
        let mut positions = BTreeMap::new();
        for endpoint in &snapshot.endpoints {
            let address = endpoint.to_string();
            for replica in 0..VIRTUAL_NODES / 4 {
                let digest = md5_digest(&format!("{}{}", address, replica));
                for group in 0..4 {
                    positions.insert(position(&digest, group), endpoint.clone());
                }
            }
        }
        HashRing {
            snapshot_version: snapshot.version,
            positions,
        }
    }

    pub fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Owner of the first position at or after `key`'s hash, wrapping to
    /// the lowest position.
    pub fn select(&self, key: &str) -> Option<&Endpoint> {
        let hash = position(&md5_digest(key), 0);
        self.positions
            .range(hash..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, endpoint)| endpoint)
    }
}

fn md5_digest(input: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let mut digest = [0u8; 16];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

/// Reads the `group`th 4-byte group of a digest as a little-endian u32.
fn position(digest: &[u8; 16], group: usize) -> u32 {
    let start = group * 4;
    u32::from_le_bytes([
        digest[start],
        digest[start + 1],
        digest[start + 2],
        digest[start + 3],
    ])
}

/// Loader holding the built-in balancers: `random` and `consistent_hash`.
pub fn builtin_load_balancers() -> ExtensionLoader<dyn LoadBalance> {
    ExtensionLoader::<dyn LoadBalance>::new("load_balancer")
        .register("random", || Ok(Arc::new(RandomLoadBalance) as Arc<dyn LoadBalance>))
        .register("consistent_hash", || {
            Ok(Arc::new(ConsistentHashLoadBalance::new()) as Arc<dyn LoadBalance>)
        })
}

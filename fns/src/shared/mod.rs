//! Cluster-wide store, lockers and caches underpinning the barrier, the
//! rate limiter and the idempotency tickets. A process either serves these
//! from memory or tunnels every call to a peer chosen at configuration
//! time.

mod caches;
mod local;
mod lockers;
mod remote;
mod sketch;
mod store;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use caches::Caches;
pub use local::{LocalCaches, LocalLockers, LocalStore};
pub use lockers::{Locker, Lockers};
pub use remote::{RemoteShared, SharedCommand, SharedReply};
pub use store::Store;

use crate::signature::Signer;

/// Key partition: `System` for runtime-owned keys (barrier, rate limits,
/// tickets), `User` for application keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    System,
    User,
}

impl Scope {
    pub(crate) fn key(&self, key: &[u8]) -> Vec<u8> {
        let prefix: &[u8] = match self {
            Scope::System => b"sys/",
            Scope::User => b"usr/",
        };
        [prefix, key].concat()
    }
}

/// Bundle of the three shared capabilities.
#[derive(Clone)]
pub struct Shared {
    store: Arc<dyn Store>,
    lockers: Arc<dyn Lockers>,
    caches: Arc<dyn Caches>,
}

impl Shared {
    pub fn new(
        store: Arc<dyn Store>,
        lockers: Arc<dyn Lockers>,
        caches: Arc<dyn Caches>,
    ) -> Self {
        Self {
            store,
            lockers,
            caches,
        }
    }

    /// In-process implementation; `cache_capacity` bounds the cache cost in
    /// bytes.
    pub fn local(cache_capacity: usize) -> Self {
        Self {
            store: Arc::new(LocalStore::new()),
            lockers: Arc::new(LocalLockers::new()),
            caches: Arc::new(LocalCaches::new(cache_capacity)),
        }
    }

    /// Tunnel every call as a signed HTTP request to `address`.
    pub fn remote(address: impl Into<String>, signer: Signer, device_id: impl Into<String>) -> Self {
        let tunnel = RemoteShared::new(address, signer, device_id);
        Self {
            store: Arc::new(tunnel.clone()),
            lockers: Arc::new(tunnel.clone()),
            caches: Arc::new(tunnel),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn lockers(&self) -> &Arc<dyn Lockers> {
        &self.lockers
    }

    pub fn caches(&self) -> &Arc<dyn Caches> {
        &self.caches
    }
}

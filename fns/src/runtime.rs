use std::sync::{Arc, OnceLock};

use crate::cluster::Node;
use crate::errors::CodeError;
use crate::services::Endpoints;
use crate::shared::Shared;
use crate::signature::Signer;
use crate::workers::Workers;

/// Process-wide handle carried by every context: identity, the signer,
/// the worker pool, the shared substrate and the dispatcher. Assembled
/// once at startup; the dispatcher is installed right after it is built.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    node: Node,
    signer: Signer,
    workers: Workers,
    shared: Shared,
    endpoints: OnceLock<Endpoints>,
}

impl Runtime {
    pub fn new(node: Node, signer: Signer, workers: Workers, shared: Shared) -> Self {
        Self {
            inner: Arc::new(Inner {
                node,
                signer,
                workers,
                shared,
                endpoints: OnceLock::new(),
            }),
        }
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn signer(&self) -> &Signer {
        &self.inner.signer
    }

    pub fn workers(&self) -> &Workers {
        &self.inner.workers
    }

    pub fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Install the dispatcher; effective once, later calls are ignored.
    pub fn install_endpoints(&self, endpoints: Endpoints) {
        self.inner.endpoints.set(endpoints).ok();
    }

    /// The dispatcher, for services invoking other services through their
    /// context.
    pub fn endpoints(&self) -> Result<&Endpoints, CodeError> {
        self.inner
            .endpoints
            .get()
            .ok_or_else(|| CodeError::unavailable("dispatcher is not installed yet"))
    }
}

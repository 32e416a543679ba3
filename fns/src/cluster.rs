use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::config::ClusterConfig;
use crate::context::Context;
use crate::errors::CodeError;
use crate::header;
use crate::shared::Shared;
use crate::signature::Signer;
use crate::versions::Version;

/// One process of the cluster. Identity is stable for a process lifetime;
/// nodes compare and order by id so membership diffs are deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub address: String,
    #[serde(default)]
    pub services: Vec<String>,
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// Contract every cluster implementation fulfils. The concrete gossip or
/// discovery mechanism stays outside the core; the runtime only joins,
/// leaves, lists members and borrows the shared substrate.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn join(&self, ctx: &Context, node: Node) -> Result<(), CodeError>;
    async fn leave(&self, ctx: &Context) -> Result<(), CodeError>;
    async fn nodes(&self, ctx: &Context) -> Result<Vec<Node>, CodeError>;
    fn shared(&self) -> Shared;
}

/// Builds a [`Cluster`] from configuration. Implementations register by
/// kind at process start.
pub trait ClusterBuilder: Send + Sync {
    fn build(
        &self,
        config: &ClusterConfig,
        signer: Signer,
        shared: Shared,
    ) -> Result<Arc<dyn Cluster>, CodeError>;
}

static BUILDERS: Lazy<RwLock<HashMap<String, Arc<dyn ClusterBuilder>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a cluster builder under `kind`. Write-once at init; a second
/// registration for the same kind replaces the first, which test harnesses
/// rely on.
pub fn register(kind: &str, builder: Arc<dyn ClusterBuilder>) {
    BUILDERS
        .write()
        .unwrap()
        .insert(kind.to_string(), builder);
}

/// Reset the builder registry. Intended for test harnesses only.
pub fn reset() {
    BUILDERS.write().unwrap().clear();
}

/// Build the configured cluster; the built-in `members` kind is always
/// available.
pub fn build(
    config: &ClusterConfig,
    signer: Signer,
    shared: Shared,
) -> Result<Arc<dyn Cluster>, CodeError> {
    if config.kind == MEMBERS_KIND {
        return MembersBuilder.build(config, signer, shared);
    }
    let builder = BUILDERS
        .read()
        .unwrap()
        .get(&config.kind)
        .cloned()
        .ok_or_else(|| {
            CodeError::internal(format!("unknown cluster kind '{}'", config.kind))
        })?;
    builder.build(config, signer, shared)
}

pub const MEMBERS_KIND: &str = "members";

struct MembersBuilder;

impl ClusterBuilder for MembersBuilder {
    fn build(
        &self,
        config: &ClusterConfig,
        _signer: Signer,
        shared: Shared,
    ) -> Result<Arc<dyn Cluster>, CodeError> {
        Ok(Arc::new(MembersCluster {
            members: config.members.clone(),
            client: reqwest::Client::new(),
            shared,
        }))
    }
}

/// Static membership: peers are listed in configuration and probed over
/// their health endpoint, which needs no signature. Join and leave are
/// no-ops, the member list being configuration.
pub struct MembersCluster {
    members: Vec<String>,
    client: reqwest::Client,
    shared: Shared,
}

#[derive(Deserialize)]
struct HealthReply {
    id: String,
    name: String,
    version: Version,
}

impl MembersCluster {
    async fn probe(&self, ctx: &Context, address: &str) -> Result<Node, CodeError> {
        let url = format!("http://{address}/application/health");
        let mut request = self.client.get(url).timeout(Duration::from_secs(2));
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining.min(Duration::from_secs(2)));
        }
        let response = request
            .send()
            .await
            .map_err(|e| CodeError::unavailable(format!("member '{address}': {e}")))?;
        let health: HealthReply = response
            .json()
            .await
            .map_err(|e| CodeError::unavailable(format!("member '{address}': {e}")))?;
        Ok(Node {
            id: health.id,
            name: health.name,
            version: health.version,
            address: address.to_string(),
            services: Vec::new(),
        })
    }
}

#[async_trait]
impl Cluster for MembersCluster {
    async fn join(&self, _ctx: &Context, _node: Node) -> Result<(), CodeError> {
        Ok(())
    }

    async fn leave(&self, _ctx: &Context) -> Result<(), CodeError> {
        Ok(())
    }

    async fn nodes(&self, ctx: &Context) -> Result<Vec<Node>, CodeError> {
        let mut nodes = Vec::with_capacity(self.members.len());
        for address in &self.members {
            match self.probe(ctx, address).await {
                Ok(node) => nodes.push(node),
                Err(err) => {
                    log::warn!(target: "cluster", "Skipping member '{address}': {err}");
                }
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    fn shared(&self) -> Shared {
        self.shared.clone()
    }
}

/// Signed headers for body-less GETs between peers; the signed content is
/// the device id, per the wire contract.
pub fn signed_get_headers(signer: &Signer, device_id: &str) -> [(&'static str, String); 3] {
    [
        (header::DEVICE_ID, device_id.to_string()),
        (header::REQUEST_INTERNAL, "1".to_string()),
        (
            header::REQUEST_SIGNATURE,
            signer.sign(device_id.as_bytes()),
        ),
    ]
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            name: "fns".to_string(),
            version: Version::new(1, 0, 0),
            address: format!("{id}.local:80"),
            services: Vec::new(),
        }
    }

    #[test]
    fn test_nodes_compare_by_id() {
        let mut a = node("a");
        a.version = Version::new(9, 9, 9);
        let a2 = node("a");

        assert_eq!(a, a2);
        assert!(node("a") < node("b"));

        let mut all = vec![node("c"), node("a"), node("b")];
        all.sort();
        let ids: Vec<&str> = all.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn test_builder_registry() {
        struct NullCluster(Shared);

        #[async_trait]
        impl Cluster for NullCluster {
            async fn join(&self, _: &Context, _: Node) -> Result<(), CodeError> {
                Ok(())
            }
            async fn leave(&self, _: &Context) -> Result<(), CodeError> {
                Ok(())
            }
            async fn nodes(&self, _: &Context) -> Result<Vec<Node>, CodeError> {
                Ok(Vec::new())
            }
            fn shared(&self) -> Shared {
                self.0.clone()
            }
        }

        struct NullBuilder;

        impl ClusterBuilder for NullBuilder {
            fn build(
                &self,
                _: &ClusterConfig,
                _: Signer,
                shared: Shared,
            ) -> Result<Arc<dyn Cluster>, CodeError> {
                Ok(Arc::new(NullCluster(shared)))
            }
        }

        reset();
        register("null", Arc::new(NullBuilder));

        let mut config = ClusterConfig::default();
        config.kind = "null".to_string();
        let shared = Shared::local(1024);
        assert!(build(&config, Signer::new("k"), shared.clone()).is_ok());

        config.kind = "nope".to_string();
        assert!(build(&config, Signer::new("k"), shared).is_err());
        reset();
    }
}

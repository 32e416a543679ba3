use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cluster::{self, Cluster};
use crate::context::Context;
use crate::errors::CodeError;
use crate::signature::Signer;
use crate::versions::{AcceptedVersions, Version};

use super::endpoint::{Endpoint, RemoteEndpoint};

/// One line of a peer's `/services/names` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamesEntry {
    pub name: String,
    #[serde(default)]
    pub internal: bool,
    pub version: Version,
}

/// Consecutive refresh failures before a peer is quarantined.
const QUARANTINE_AFTER: u32 = 3;
/// How long a quarantined peer keeps its record before removal, so a quick
/// re-registration reuses the endpoints instead of rebuilding them.
const QUARANTINE_GRACE: Duration = Duration::from_secs(60);

/// Mirror of peer nodes and their advertised services, kept fresh by the
/// membership refresh loop. Single writer, many readers: lookups borrow an
/// immutable snapshot that writers replace atomically.
#[derive(Clone)]
pub struct Registrations {
    inner: Arc<Inner>,
}

struct Inner {
    self_id: String,
    client: reqwest::Client,
    signer: Signer,
    snapshot: RwLock<Arc<Snapshot>>,
}

#[derive(Default)]
struct Snapshot {
    peers: BTreeMap<String, Peer>,
}

#[derive(Clone)]
struct Peer {
    node: cluster::Node,
    endpoints: BTreeMap<String, Arc<RemoteEndpoint>>,
    state: PeerState,
    failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PeerState {
    Registered,
    Quarantined(Instant),
}

impl Registrations {
    pub fn new(self_id: impl Into<String>, signer: Signer) -> Self {
        Self {
            inner: Arc::new(Inner {
                self_id: self_id.into(),
                client: reqwest::Client::new(),
                signer,
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
            }),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.read().unwrap().clone()
    }

    /// Register a peer with the services it advertises, replacing any
    /// prior record. Also used directly by tests and static wiring.
    pub fn register(&self, node: cluster::Node, services: Vec<NamesEntry>) {
        let peer = self.build_peer(node, services);
        let mut guard = self.inner.snapshot.write().unwrap();
        let mut next = clone_snapshot(&guard);
        next.peers.insert(peer.node.id.clone(), peer);
        *guard = Arc::new(next);
    }

    fn build_peer(&self, node: cluster::Node, services: Vec<NamesEntry>) -> Peer {
        let mut endpoints = BTreeMap::new();
        let mut advertised = Vec::with_capacity(services.len());
        for entry in services {
            let mut node = node.clone();
            node.services = Vec::new();
            advertised.push(entry.name.clone());
            endpoints.insert(
                entry.name.clone(),
                Arc::new(RemoteEndpoint::new(
                    node,
                    entry.internal,
                    self.inner.client.clone(),
                    self.inner.signer.clone(),
                )),
            );
        }
        let mut node = node;
        node.services = advertised;
        Peer {
            node,
            endpoints,
            state: PeerState::Registered,
            failures: 0,
        }
    }

    /// Reconcile the mirror against a fresh membership listing: discover
    /// services of new nodes, drop departed ones, quarantine peers whose
    /// refresh keeps failing and reap them after the grace window.
    pub async fn refresh(&self, ctx: &Context, mut members: Vec<cluster::Node>) {
        members.sort();
        members.dedup();

        let current = self.snapshot();
        let mut next = Snapshot::default();
        let now = Instant::now();

        for member in members {
            if member.id == self.inner.self_id {
                continue;
            }
            match current.peers.get(&member.id) {
                Some(existing) if !existing.endpoints.is_empty() => {
                    // Known peer: refresh address/version, keep endpoints.
                    let mut peer = existing.clone();
                    peer.node.address = member.address.clone();
                    peer.node.version = member.version;
                    match peer.state {
                        PeerState::Quarantined(since)
                            if now.duration_since(since) > QUARANTINE_GRACE =>
                        {
                            log::debug!(
                                target: "registry",
                                "Dropping quarantined peer '{}'", member.id
                            );
                            continue;
                        }
                        _ => {}
                    }
                    next.peers.insert(member.id.clone(), peer);
                }
                prior => {
                    let failures = prior.map(|p| p.failures).unwrap_or(0);
                    match self.fetch_names(ctx, &member).await {
                        Ok(services) => {
                            log::info!(
                                target: "registry",
                                "Registered peer '{}' with {} service(s)",
                                member.id,
                                services.len()
                            );
                            next.peers
                                .insert(member.id.clone(), self.build_peer(member, services));
                        }
                        Err(err) => {
                            let failures = failures + 1;
                            log::warn!(
                                target: "registry",
                                "Peer '{}' refresh failed ({failures}): {err}", member.id
                            );
                            let state = match prior.map(|p| p.state) {
                                Some(PeerState::Quarantined(since)) => {
                                    if now.duration_since(since) > QUARANTINE_GRACE {
                                        log::debug!(
                                            target: "registry",
                                            "Dropping quarantined peer '{}'", member.id
                                        );
                                        continue;
                                    }
                                    PeerState::Quarantined(since)
                                }
                                _ if failures >= QUARANTINE_AFTER => PeerState::Quarantined(now),
                                _ => PeerState::Registered,
                            };
                            next.peers.insert(
                                member.id.clone(),
                                Peer {
                                    node: member,
                                    endpoints: BTreeMap::new(),
                                    state,
                                    failures,
                                },
                            );
                        }
                    }
                }
            }
        }

        *self.inner.snapshot.write().unwrap() = Arc::new(next);
    }

    async fn fetch_names(
        &self,
        ctx: &Context,
        node: &cluster::Node,
    ) -> Result<Vec<NamesEntry>, CodeError> {
        let url = format!("http://{}/services/names", node.address);
        let mut request = self.inner.client.get(url).timeout(Duration::from_secs(2));
        for (name, value) in cluster::signed_get_headers(&self.inner.signer, &self.inner.self_id) {
            request = request.header(name, value);
        }
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining.min(Duration::from_secs(2)));
        }
        let response = request
            .send()
            .await
            .map_err(|e| CodeError::unavailable(format!("names of '{}': {e}", node.id)))?;
        if !response.status().is_success() {
            return Err(CodeError::unavailable(format!(
                "names of '{}' replied with status {}",
                node.id,
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CodeError::unavailable(format!("names of '{}': {e}", node.id)))
    }

    /// Highest qualifying version wins; ties break by node id, so equal
    /// snapshots select identically everywhere.
    pub fn get(&self, service: &str, accepted: &AcceptedVersions) -> Option<Endpoint> {
        let snapshot = self.snapshot();
        let mut candidates: Vec<(&Peer, &Arc<RemoteEndpoint>)> = snapshot
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::Registered)
            .filter_map(|peer| peer.endpoints.get(service).map(|ep| (peer, ep)))
            .filter(|(peer, _)| accepted.allows(service, &peer.node.version))
            .collect();
        candidates.sort_by(|(a, _), (b, _)| {
            b.node
                .version
                .cmp(&a.node.version)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        candidates
            .first()
            .map(|(_, endpoint)| Endpoint::Remote((*endpoint).clone()))
    }

    /// Exact-peer lookup, bypassing version selection.
    pub fn get_exact(&self, service: &str, node_id: &str) -> Option<Endpoint> {
        let snapshot = self.snapshot();
        let peer = snapshot.peers.get(node_id)?;
        if peer.state != PeerState::Registered {
            return None;
        }
        peer.endpoints
            .get(service)
            .map(|endpoint| Endpoint::Remote(endpoint.clone()))
    }

    /// Name entries of every registered peer service, deduplicated by
    /// name keeping the highest advertised version.
    pub fn entries(&self) -> Vec<NamesEntry> {
        let snapshot = self.snapshot();
        let mut merged: BTreeMap<String, NamesEntry> = BTreeMap::new();
        for peer in snapshot.peers.values() {
            if peer.state != PeerState::Registered {
                continue;
            }
            for (name, endpoint) in &peer.endpoints {
                let entry = NamesEntry {
                    name: name.clone(),
                    internal: endpoint.internal,
                    version: peer.node.version,
                };
                match merged.get(name) {
                    Some(existing) if existing.version >= entry.version => {}
                    _ => {
                        merged.insert(name.clone(), entry);
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Current membership view.
    pub fn nodes(&self) -> Vec<cluster::Node> {
        self.snapshot()
            .peers
            .values()
            .map(|peer| peer.node.clone())
            .collect()
    }

    /// Spawn the long-lived refresh loop; the returned handle is aborted
    /// at shutdown. Errors log and retry next tick, never blocking request
    /// handling.
    pub fn spawn_refresh_loop(
        &self,
        cluster: Arc<dyn Cluster>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registrations = self.clone();
        tokio::spawn(async move {
            loop {
                let ctx = Context::background().with_timeout(interval);
                match cluster.nodes(&ctx).await {
                    Ok(members) => registrations.refresh(&ctx, members).await,
                    Err(err) => {
                        log::warn!(target: "registry", "Fetching cluster members failed: {err}");
                    }
                }
                tokio::time::sleep(interval).await;
            }
        })
    }
}

fn clone_snapshot(snapshot: &Arc<Snapshot>) -> Snapshot {
    Snapshot {
        peers: snapshot.peers.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: &str, version: &str) -> cluster::Node {
        cluster::Node {
            id: id.to_string(),
            name: "payments-app".to_string(),
            version: version.parse().unwrap(),
            address: format!("{id}.local:80"),
            services: Vec::new(),
        }
    }

    fn entry(name: &str, version: &str) -> NamesEntry {
        NamesEntry {
            name: name.to_string(),
            internal: false,
            version: version.parse().unwrap(),
        }
    }

    fn registrations() -> Registrations {
        Registrations::new("self", Signer::new("k"))
    }

    #[test]
    fn test_version_selection() {
        let registry = registrations();
        registry.register(node("n2", "1.2.0"), vec![entry("payments", "1.2.0")]);
        registry.register(node("n1", "1.3.0"), vec![entry("payments", "1.3.0")]);

        let pick = |accepted: &str| -> Option<String> {
            registry
                .get("payments", &accepted.parse().unwrap())
                .map(|ep| match ep {
                    Endpoint::Remote(remote) => remote.node().id.clone(),
                    Endpoint::Local(_) => unreachable!(),
                })
        };

        // Highest qualifying version wins.
        assert_eq!(pick(","), Some("n1".to_string()));
        assert_eq!(pick("1.3.0,"), Some("n1".to_string()));
        assert_eq!(pick("1.0.0,1.2.9"), Some("n2".to_string()));
        assert_eq!(pick("2.0.0,"), None);
    }

    #[test]
    fn test_tie_breaks_by_node_id() {
        let registry = registrations();
        registry.register(node("b", "1.0.0"), vec![entry("users", "1.0.0")]);
        registry.register(node("a", "1.0.0"), vec![entry("users", "1.0.0")]);

        let Some(Endpoint::Remote(picked)) =
            registry.get("users", &AcceptedVersions::default())
        else {
            panic!("expected an endpoint");
        };
        assert_eq!(picked.node().id, "a");
    }

    #[test]
    fn test_get_exact_and_unknown_service() {
        let registry = registrations();
        registry.register(node("n1", "1.0.0"), vec![entry("users", "1.0.0")]);

        assert!(registry.get_exact("users", "n1").is_some());
        assert!(registry.get_exact("users", "n2").is_none());
        assert!(registry
            .get("billing", &AcceptedVersions::default())
            .is_none());
    }

    #[tokio::test]
    async fn test_refresh_drops_departed_peers() {
        let registry = registrations();
        registry.register(node("n1", "1.0.0"), vec![entry("users", "1.0.0")]);
        registry.register(node("n2", "1.0.0"), vec![entry("users", "1.0.0")]);

        // Only n1 remains a member; its endpoints survive untouched.
        registry
            .refresh(&Context::background(), vec![node("n1", "1.1.0")])
            .await;

        assert!(registry.get_exact("users", "n1").is_some());
        assert!(registry.get_exact("users", "n2").is_none());
        let nodes = registry.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].version, "1.1.0".parse().unwrap());
    }

    #[tokio::test]
    async fn test_refresh_skips_self() {
        let registry = registrations();
        registry
            .refresh(&Context::background(), vec![node("self", "1.0.0")])
            .await;
        assert!(registry.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_member_is_quarantined_after_failures() {
        let registry = registrations();
        let member = || {
            let mut n = node("ghost", "1.0.0");
            // Nothing listens here; names discovery fails fast.
            n.address = "127.0.0.1:1".to_string();
            n
        };

        for _ in 0..QUARANTINE_AFTER {
            registry
                .refresh(&Context::background(), vec![member()])
                .await;
        }

        // The record is kept but never selected.
        assert_eq!(registry.nodes().len(), 1);
        assert!(registry
            .get("users", &AcceptedVersions::default())
            .is_none());

        let snapshot = registry.snapshot();
        let peer = snapshot.peers.get("ghost").unwrap();
        assert!(matches!(peer.state, PeerState::Quarantined(_)));
    }
}

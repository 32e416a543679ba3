//! Services, the requests they serve and the endpoints they are reached
//! through.

mod endpoint;
mod endpoints;
mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::Xxh64;

pub use endpoint::{
    Endpoint, InternalRequestEnvelope, InternalResponseEnvelope, LocalEndpoint, RemoteEndpoint,
};
pub use endpoints::{Endpoints, EndpointsBuilder, GetOptions};
pub use registry::{NamesEntry, Registrations};

use crate::argument::Argument;
use crate::context::Context;
use crate::errors::CodeError;
use crate::tracer::Tracer;
use crate::versions::{AcceptedVersions, Version};

/// The caller a request acts for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl User {
    pub fn authenticated(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Opaque metadata propagated across hops. Callees may write entries; a
/// peer reply merges its trunk back into the caller's.
#[derive(Debug, Clone, Default)]
pub struct Trunk {
    inner: Arc<Mutex<BTreeMap<String, String>>>,
}

impl Trunk {
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().unwrap().insert(key.into(), value.into());
    }

    pub fn merge(&self, entries: BTreeMap<String, String>) {
        self.inner.lock().unwrap().extend(entries);
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl From<BTreeMap<String, String>> for Trunk {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entries)),
        }
    }
}

impl PartialEq for Trunk {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Serialize for Trunk {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Trunk {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(BTreeMap::<String, String>::deserialize(deserializer)?.into())
    }
}

/// One invocation travelling through the dispatcher: identity, target,
/// argument and everything the trust boundary needs.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub service: String,
    pub fn_name: String,
    pub argument: Argument,
    pub device_id: String,
    pub device_ip: String,
    pub accepted_versions: AcceptedVersions,
    /// Whether the request arrived from a trusted peer; only set after
    /// signature verification.
    pub internal: bool,
    pub trunk: Trunk,
    pub user: User,
    pub headers: BTreeMap<String, String>,
}

impl Request {
    pub fn new(service: impl Into<String>, fn_name: impl Into<String>, argument: Argument) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            fn_name: fn_name.into(),
            argument,
            device_id: String::new(),
            device_ip: String::new(),
            accepted_versions: AcceptedVersions::default(),
            internal: false,
            trunk: Trunk::default(),
            user: User::default(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_device(mut self, id: impl Into<String>, ip: impl Into<String>) -> Self {
        self.device_id = id.into();
        self.device_ip = ip.into();
        self
    }

    pub fn with_accepted_versions(mut self, accepted: AcceptedVersions) -> Self {
        self.accepted_versions = accepted;
        self
    }

    pub fn with_internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn with_trunk(mut self, trunk: Trunk) -> Self {
        self.trunk = trunk;
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Content-addressed identity over target, argument, device and
    /// version constraints; the barrier and the response cache key on it.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Xxh64::new(0);
        hasher.update(self.service.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(self.fn_name.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(&self.argument.digest().to_le_bytes());
        hasher.update(self.device_id.as_bytes());
        hasher.update(&[0xff]);
        hasher.update(self.accepted_versions.to_string().as_bytes());
        Fingerprint(hasher.digest())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A named unit of functions hosted by this process. `internal` services
/// are invisible outside the trust boundary.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn internal(&self) -> bool {
        false
    }

    fn document(&self) -> Document;

    async fn handle(
        &self,
        ctx: Context,
        fn_name: &str,
        argument: Argument,
    ) -> Result<Argument, CodeError>;
}

/// Self-description a service publishes; the gateway aggregates these and
/// derives the OpenAPI rendering from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub name: String,
    pub description: String,
    pub version: Version,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub fns: Vec<FnDocument>,
}

impl Document {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        version: Version,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version,
            internal: false,
            fns: Vec::new(),
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_fn(mut self, fn_doc: FnDocument) -> Self {
        self.fns.push(fn_doc);
        self
    }

    pub fn fn_document(&self, fn_name: &str) -> Option<&FnDocument> {
        self.fns.iter().find(|f| f.name == fn_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FnDocument {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Marks a fn without side effects; only these take part in response
    /// caching.
    #[serde(default)]
    pub readonly: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_max_age_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl FnDocument {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            readonly: false,
            cache_max_age_seconds: None,
            argument: None,
            result: None,
        }
    }

    pub fn readonly(mut self, cache_max_age_seconds: u64) -> Self {
        self.readonly = true;
        self.cache_max_age_seconds = Some(cache_max_age_seconds);
        self
    }
}

/// Whether the current call may reach internal services: either it arrived
/// as a verified peer request, or it originates inside another handler,
/// which the started tracer betrays.
pub fn can_access_internal(ctx: &Context) -> bool {
    if let Some(request) = ctx.request() {
        if request.internal {
            return true;
        }
    }
    ctx.tracer().map(Tracer::started).unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(device: &str, body: &[u8]) -> Request {
        Request::new("math", "add", Argument::from_raw(body.to_vec()).unwrap())
            .with_device(device, "127.0.0.1")
    }

    #[test]
    fn test_fingerprint_stability() {
        let a = request("d1", br#"{"a":2,"b":3}"#);
        let b = request("d1", br#"{"a":2,"b":3}"#);
        assert_eq!(a.fingerprint(), b.fingerprint());

        // Request ids do not take part in the fingerprint.
        let c = request("d1", br#"{"a":2,"b":3}"#).with_id("fixed");
        assert_eq!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_dimensions() {
        let base = request("d1", br#"{"a":2}"#);
        assert_ne!(
            base.fingerprint(),
            request("d2", br#"{"a":2}"#).fingerprint()
        );
        assert_ne!(
            base.fingerprint(),
            request("d1", br#"{"a":3}"#).fingerprint()
        );

        let versioned = request("d1", br#"{"a":2}"#)
            .with_accepted_versions("1.0.0,".parse().unwrap());
        assert_ne!(base.fingerprint(), versioned.fingerprint());
    }

    #[test]
    fn test_trunk_merge() {
        let trunk = Trunk::default();
        trunk.set("tenant", "acme");
        trunk.merge(BTreeMap::from([("hop".to_string(), "2".to_string())]));

        assert_eq!(trunk.get("tenant").as_deref(), Some("acme"));
        assert_eq!(trunk.snapshot().len(), 2);
    }

    #[test]
    fn test_internal_access() {
        let ctx = Context::background();
        assert!(!can_access_internal(&ctx));

        let internal = Arc::new(
            Request::new("a", "b", Argument::empty()).with_internal(true),
        );
        assert!(can_access_internal(&ctx.with_request(internal)));

        // A started tracer marks a call made from inside a handler.
        let tracer = Tracer::new("req");
        let ctx = ctx.with_tracer(tracer.clone());
        assert!(!can_access_internal(&ctx));
        let _span = tracer.start_span("svc", "fn");
        assert!(can_access_internal(&ctx));
    }
}

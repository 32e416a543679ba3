use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::argument::Argument;
use crate::cluster::Node;
use crate::context::Context;
use crate::errors::CodeError;
use crate::future::{future, Future, Promise};
use crate::header;
use crate::signature::Signer;
use crate::tracer::{SpanTree, Tracer};
use crate::workers::{Task, Workers};

use super::{Document, Request, Service, User};

/// Invocation surface of one service at one location.
#[derive(Clone)]
pub enum Endpoint {
    Local(Arc<LocalEndpoint>),
    Remote(Arc<RemoteEndpoint>),
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Local(_) => f.write_str("Endpoint::Local(..)"),
            Endpoint::Remote(_) => f.write_str("Endpoint::Remote(..)"),
        }
    }
}

impl Endpoint {
    pub fn request(&self, ctx: &Context, request: Arc<Request>) -> Future {
        match self {
            Endpoint::Local(endpoint) => endpoint.request(ctx, request),
            Endpoint::Remote(endpoint) => endpoint.request(ctx, request),
        }
    }

    pub async fn request_sync(
        &self,
        ctx: &Context,
        request: Arc<Request>,
    ) -> Result<Argument, CodeError> {
        let ctx = ctx.clone();
        self.request(&ctx, request).get(&ctx).await
    }

    pub fn internal(&self) -> bool {
        match self {
            Endpoint::Local(endpoint) => endpoint.service().internal(),
            Endpoint::Remote(endpoint) => endpoint.internal,
        }
    }
}

/// Endpoint of a locally mounted service, executing through the worker
/// pool.
pub struct LocalEndpoint {
    service: Arc<dyn Service>,
    workers: Workers,
}

impl LocalEndpoint {
    pub fn new(service: Arc<dyn Service>, workers: Workers) -> Self {
        Self { service, workers }
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn document(&self) -> Document {
        self.service.document()
    }

    /// Enrich the context with the request (and a tracer when missing),
    /// then offer the fn task to the pool. Saturation completes the future
    /// with `overloaded`, an already-expired context with `timeout`.
    pub fn request(&self, ctx: &Context, request: Arc<Request>) -> Future {
        let (promise, fut) = future();
        let ctx = match ctx.tracer() {
            Some(_) => ctx.with_request(request.clone()),
            None => ctx
                .with_tracer(Tracer::new(request.id.clone()))
                .with_request(request.clone()),
        };

        if ctx.is_expired() {
            promise.fail(CodeError::timeout("deadline exceeded before dispatch"));
            return fut;
        }

        let task = FnTask {
            name: format!("{}/{}", request.service, request.fn_name),
            service: self.service.clone(),
            request,
            promise: Some(promise),
        };
        // A rejected task drops here, completing the future as overloaded.
        self.workers.dispatch(&ctx, Box::new(task));
        fut
    }

    pub async fn request_sync(
        &self,
        ctx: &Context,
        request: Arc<Request>,
    ) -> Result<Argument, CodeError> {
        let ctx = ctx.clone();
        self.request(&ctx, request).get(&ctx).await
    }
}

struct FnTask {
    name: String,
    service: Arc<dyn Service>,
    request: Arc<Request>,
    promise: Option<Promise>,
}

impl Drop for FnTask {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.take() {
            promise.fail(CodeError::overloaded("worker pool saturated"));
        }
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(mut self: Box<Self>, ctx: Context) {
        let Some(promise) = self.promise.take() else {
            return;
        };
        let span = ctx
            .tracer()
            .map(|tracer| tracer.start_span(&self.request.service, &self.request.fn_name));

        let result = self
            .service
            .handle(ctx.clone(), &self.request.fn_name, self.request.argument.clone())
            .await;

        if let Some(span) = &span {
            if let Err(err) = &result {
                span.tag("error", &err.name);
            }
            span.finish();
        }
        match result {
            Ok(value) => promise.succeed(value),
            Err(err) => promise.fail(err),
        }
    }
}

/// What a peer receives: the caller's argument plus the propagated trunk
/// and user, all signed as one body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalRequestEnvelope {
    pub body: Argument,
    #[serde(default)]
    pub trunk: BTreeMap<String, String>,
    #[serde(default)]
    pub user: User,
}

/// What a peer replies: result body, the (possibly amended) trunk and
/// user, and the span subtree to graft into the caller's tracer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalResponseEnvelope {
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub trunk: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<SpanTree>,
    pub body: Argument,
}

/// Endpoint of a service advertised by a peer node. Requests are signed
/// with the process secret and carried in the internal envelope.
pub struct RemoteEndpoint {
    node: Node,
    pub(crate) internal: bool,
    client: reqwest::Client,
    signer: Signer,
}

impl RemoteEndpoint {
    pub fn new(node: Node, internal: bool, client: reqwest::Client, signer: Signer) -> Self {
        Self {
            node,
            internal,
            client,
            signer,
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    /// The peer call substitutes the HTTP client for the worker pool; the
    /// future completes when the peer replies.
    pub fn request(&self, ctx: &Context, request: Arc<Request>) -> Future {
        let (promise, fut) = future();
        let ctx = ctx.clone();
        let node = self.node.clone();
        let client = self.client.clone();
        let signer = self.signer.clone();

        tokio::spawn(async move {
            let span = ctx
                .tracer()
                .map(|tracer| tracer.start_span(&request.service, &request.fn_name));
            let result = call(&ctx, &node, &client, &signer, &request).await;
            if let Some(span) = &span {
                if let Err(err) = &result {
                    span.tag("error", &err.name);
                }
                span.finish();
            }
            match result {
                Ok(value) => promise.succeed(value),
                Err(err) => promise.fail(err),
            }
        });
        fut
    }

    pub async fn request_sync(
        &self,
        ctx: &Context,
        request: Arc<Request>,
    ) -> Result<Argument, CodeError> {
        let ctx = ctx.clone();
        self.request(&ctx, request).get(&ctx).await
    }
}

async fn call(
    ctx: &Context,
    node: &Node,
    client: &reqwest::Client,
    signer: &Signer,
    request: &Request,
) -> Result<Argument, CodeError> {
    let envelope = InternalRequestEnvelope {
        body: request.argument.clone(),
        trunk: request.trunk.snapshot(),
        user: request.user.clone(),
    };
    let body = serde_json::to_vec(&envelope)?;
    let signature = signer.sign(&body);
    let url = format!(
        "http://{}/services/{}/{}",
        node.address, request.service, request.fn_name
    );

    let mut http = client
        .post(url)
        .header("Content-Type", "application/json")
        .header(header::REQUEST_INTERNAL, "1")
        .header(header::REQUEST_SIGNATURE, signature)
        .header(header::REQUEST_ID, &request.id)
        .header(header::DEVICE_ID, &request.device_id)
        .header(header::DEVICE_IP, &request.device_ip);
    if !request.accepted_versions.is_empty() {
        http = http.header(
            header::REQUEST_VERSION,
            request.accepted_versions.to_string(),
        );
    }
    if let Some(remaining) = ctx.remaining() {
        http = http.header(
            header::REQUEST_TIMEOUT,
            remaining.as_millis().to_string(),
        );
        http = http.timeout(remaining.max(Duration::from_millis(1)));
    }

    let response = http.body(body).send().await.map_err(|e| {
        if e.is_timeout() {
            CodeError::timeout(format!("peer '{}' timed out", node.id))
        } else {
            CodeError::unavailable(format!("peer '{}' unreachable: {e}", node.id))
        }
    })?;
    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| {
        CodeError::unavailable(format!("peer '{}' failed mid-reply: {e}", node.id))
    })?;

    if !status.is_success() {
        // Surface the peer's own error when it decodes as one.
        return Err(serde_json::from_slice::<CodeError>(&bytes).unwrap_or_else(|_| {
            CodeError::internal(format!("peer '{}' replied with status {status}", node.id))
        }));
    }

    let envelope: InternalResponseEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| CodeError::internal(format!("peer '{}' reply does not decode: {e}", node.id)))?;
    if let (Some(tracer), Some(span)) = (ctx.tracer(), envelope.span) {
        tracer.mount(span);
    }
    request.trunk.merge(envelope.trunk);
    Ok(envelope.body)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::services::Document;
    use crate::versions::Version;
    use crate::workers;

    struct Adder;

    #[async_trait]
    impl Service for Adder {
        fn name(&self) -> &str {
            "math"
        }

        fn document(&self) -> Document {
            Document::new("math", "arithmetic", Version::new(1, 0, 0))
        }

        async fn handle(
            &self,
            _ctx: Context,
            fn_name: &str,
            argument: Argument,
        ) -> Result<Argument, CodeError> {
            match fn_name {
                "add" => {
                    #[derive(Deserialize)]
                    struct Args {
                        a: i64,
                        b: i64,
                    }
                    let args: Args = argument.decode()?;
                    Argument::new(&(args.a + args.b))
                }
                other => Err(CodeError::not_found(format!("fn '{other}' not found"))),
            }
        }
    }

    #[tokio::test]
    async fn test_local_endpoint_roundtrip() {
        let workers = Workers::new(workers::Config::default());
        let endpoint = LocalEndpoint::new(Arc::new(Adder), workers);
        let request = Arc::new(Request::new(
            "math",
            "add",
            Argument::from_raw(br#"{"a":2,"b":3}"#.to_vec()).unwrap(),
        ));

        let value = endpoint
            .request_sync(&Context::background(), request)
            .await
            .unwrap();
        assert_eq!(value.decode::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_local_endpoint_unknown_fn() {
        let workers = Workers::new(workers::Config::default());
        let endpoint = LocalEndpoint::new(Arc::new(Adder), workers);
        let request = Arc::new(Request::new("math", "mul", Argument::empty()));

        let err = endpoint
            .request_sync(&Context::background(), request)
            .await
            .unwrap_err();
        assert_eq!(err.name, "not_found");
    }

    #[tokio::test]
    async fn test_saturation_surfaces_overloaded() {
        let workers = Workers::new(workers::Config {
            max_workers: 1,
            max_idle: Duration::from_secs(60),
        });
        let endpoint = LocalEndpoint::new(Arc::new(Sleeper), workers);
        let ctx = Context::background();

        let slow = endpoint.request(
            &ctx,
            Arc::new(Request::new("slow", "sleep", Argument::empty())),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rejected = endpoint
            .request_sync(
                &ctx,
                Arc::new(Request::new("slow", "sleep", Argument::empty())),
            )
            .await
            .unwrap_err();

        assert_eq!(rejected.name, "overloaded");
        assert!(slow.get(&ctx).await.is_ok());
    }

    struct Sleeper;

    #[async_trait]
    impl Service for Sleeper {
        fn name(&self) -> &str {
            "slow"
        }

        fn document(&self) -> Document {
            Document::new("slow", "sleeps", Version::new(1, 0, 0))
        }

        async fn handle(
            &self,
            _ctx: Context,
            _fn_name: &str,
            _argument: Argument,
        ) -> Result<Argument, CodeError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Argument::new(&true)
        }
    }

    #[tokio::test]
    async fn test_fn_span_is_recorded() {
        let workers = Workers::new(workers::Config::default());
        let endpoint = LocalEndpoint::new(Arc::new(Adder), workers);
        let tracer = Tracer::new("req-1");
        let ctx = Context::background().with_tracer(tracer.clone());

        endpoint
            .request_sync(
                &ctx,
                Arc::new(Request::new(
                    "math",
                    "add",
                    Argument::from_raw(br#"{"a":1,"b":1}"#.to_vec()).unwrap(),
                )),
            )
            .await
            .unwrap();

        let tree = tracer.root().unwrap();
        assert_eq!(tree.service, "math");
        assert_eq!(tree.fn_name, "add");
        assert!(tree.finished_at.is_some());
    }

    #[test]
    fn test_envelopes_roundtrip() {
        let envelope = InternalRequestEnvelope {
            body: Argument::from_raw(br#"{"a":1}"#.to_vec()).unwrap(),
            trunk: BTreeMap::from([("hop".to_string(), "1".to_string())]),
            user: User {
                id: "u-1".to_string(),
                attributes: serde_json::Map::new(),
            },
        };
        let encoded = serde_json::to_vec(&envelope).unwrap();
        let decoded: InternalRequestEnvelope = serde_json::from_slice(&encoded).unwrap();

        assert_eq!(decoded.body.bytes(), br#"{"a":1}"#);
        assert_eq!(decoded.trunk, envelope.trunk);
        assert_eq!(decoded.user, envelope.user);
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::argument::Argument;
use crate::barrier::{Barrier, BarrierFuture, LocalBarrier};
use crate::cluster::Node;
use crate::context::Context;
use crate::errors::CodeError;
use crate::tracer::Tracer;
use crate::workers::{self, Task, Workers};

use super::endpoint::{Endpoint, LocalEndpoint};
use super::registry::Registrations;
use super::{can_access_internal, Document, Request, Service};

/// Service name the tracer reporter posts span trees to, iff deployed.
pub const TRACINGS_SERVICE: &str = "tracings";

/// Endpoint resolution options.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Exact node id to resolve at; empty selects by versions.
    pub id: String,
}

impl GetOptions {
    pub fn exact(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// The dispatcher: owns the local endpoint table, reaches peers through
/// the registry, and executes requests behind the barrier with the handle
/// timeout applied.
#[derive(Clone)]
pub struct Endpoints {
    inner: Arc<Inner>,
}

struct Inner {
    node: Node,
    locals: BTreeMap<String, Arc<LocalEndpoint>>,
    registrations: Registrations,
    barrier: Arc<dyn Barrier>,
    workers: Workers,
    timeout: Duration,
}

impl Endpoints {
    pub fn builder(node: Node) -> EndpointsBuilder {
        EndpointsBuilder {
            node,
            services: Vec::new(),
            registrations: None,
            barrier: None,
            workers: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn node(&self) -> &Node {
        &self.inner.node
    }

    pub fn workers(&self) -> &Workers {
        &self.inner.workers
    }

    pub fn registrations(&self) -> &Registrations {
        &self.inner.registrations
    }

    /// Documents of the locally mounted services.
    pub fn documents(&self) -> BTreeMap<String, Document> {
        self.inner
            .locals
            .values()
            .map(|endpoint| {
                let document = endpoint.document();
                (document.name.clone(), document)
            })
            .collect()
    }

    pub fn local(&self, service: &str) -> Option<&Arc<LocalEndpoint>> {
        self.inner.locals.get(service)
    }

    /// Resolve the endpoint for `service`. Exact-id lookups other than
    /// self require internal access; otherwise the local endpoint wins
    /// when its version qualifies, falling back to registry selection.
    pub fn get(
        &self,
        ctx: &Context,
        service: &str,
        opts: &GetOptions,
    ) -> Result<Endpoint, CodeError> {
        let inner = &self.inner;
        let not_found = || CodeError::not_found(format!("service '{service}' not found"));

        if !opts.id.is_empty() {
            if opts.id == inner.node.id {
                return match inner.locals.get(service) {
                    Some(local) => {
                        if local.service().internal() && !can_access_internal(ctx) {
                            Err(not_found())
                        } else {
                            Ok(Endpoint::Local(local.clone()))
                        }
                    }
                    None => Err(not_found()),
                };
            }
            if !can_access_internal(ctx) {
                return Err(CodeError::forbidden("exact peer routing is internal"));
            }
            return inner
                .registrations
                .get_exact(service, &opts.id)
                .ok_or_else(not_found);
        }

        let accepted = ctx
            .request()
            .map(|request| request.accepted_versions.clone())
            .unwrap_or_default();

        if let Some(local) = inner.locals.get(service) {
            if local.service().internal() && !can_access_internal(ctx) {
                return Err(not_found());
            }
            if accepted.allows(service, &inner.node.version) {
                return Ok(Endpoint::Local(local.clone()));
            }
        }

        match inner.registrations.get(service, &accepted) {
            Some(endpoint) => {
                if endpoint.internal() && !can_access_internal(ctx) {
                    return Err(not_found());
                }
                Ok(endpoint)
            }
            None => Err(not_found()),
        }
    }

    /// Serve one request: fingerprint it, collapse duplicates behind the
    /// barrier, resolve the endpoint inside, and report the tracer once a
    /// non-internal response is on its way out.
    pub async fn handle(&self, ctx: &Context, request: Request) -> Result<Argument, CodeError> {
        let request = Arc::new(request);
        let key = request.fingerprint().to_string();

        let ctx = ctx.with_timeout(self.inner.timeout);
        let ctx = match ctx.tracer() {
            Some(_) => ctx,
            None => ctx.with_tracer(Tracer::new(request.id.clone())),
        };
        let ctx = ctx.with_request(request.clone());

        let this = self.clone();
        let inner_ctx = ctx.clone();
        let inner_request = request.clone();
        let fut: BarrierFuture = Box::pin(async move {
            let endpoint = this.get(&inner_ctx, &inner_request.service, &GetOptions::default())?;
            endpoint.request_sync(&inner_ctx, inner_request).await
        });

        let result = self.inner.barrier.execute(&ctx, &key, fut).await;

        if !request.internal {
            self.fork_tracer_report(&ctx);
        }
        result
    }

    /// Offer the root span to the `tracings` service on the pool, when one
    /// is deployed anywhere. Fire-and-forget.
    fn fork_tracer_report(&self, ctx: &Context) {
        let Some(tracer) = ctx.tracer() else {
            return;
        };
        let Some(root) = tracer.root() else {
            return;
        };
        if root.finished_at.is_none() {
            // A nested call is reporting through its parent; only the
            // outermost response ships the tree.
            return;
        }
        if self
            .get(ctx, TRACINGS_SERVICE, &GetOptions::default())
            .is_err()
        {
            return;
        }
        let argument = match Argument::new(&root) {
            Ok(argument) => argument,
            Err(err) => {
                log::warn!(target: "tracer", "Span tree does not encode: {err}");
                return;
            }
        };
        let device_id = ctx
            .request()
            .map(|r| r.device_id.clone())
            .unwrap_or_default();

        let report = Request::new(TRACINGS_SERVICE, "report", argument)
            .with_device(device_id, String::new())
            .with_internal(true);
        let task = ReporterTask {
            endpoints: self.clone(),
            report: Some(report),
        };
        // Reporting rides the pool with a fresh context: the response is
        // already on its way out, so the request deadline no longer binds.
        self.inner
            .workers
            .dispatch(&Context::background(), Box::new(task));
    }
}

struct ReporterTask {
    endpoints: Endpoints,
    report: Option<Request>,
}

#[async_trait]
impl Task for ReporterTask {
    fn name(&self) -> &str {
        "tracer-reporter"
    }

    async fn execute(mut self: Box<Self>, ctx: Context) {
        let Some(report) = self.report.take() else {
            return;
        };
        let ctx = ctx.with_timeout(Duration::from_secs(2));
        if let Err(err) = self.endpoints.handle(&ctx, report).await {
            log::debug!(target: "tracer", "Reporting spans failed: {err}");
        }
    }
}

pub struct EndpointsBuilder {
    node: Node,
    services: Vec<Arc<dyn Service>>,
    registrations: Option<Registrations>,
    barrier: Option<Arc<dyn Barrier>>,
    workers: Option<Workers>,
    timeout: Duration,
}

impl EndpointsBuilder {
    /// Mount a service. The endpoint table is read-only once built.
    pub fn mount(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    pub fn registrations(mut self, registrations: Registrations) -> Self {
        self.registrations = Some(registrations);
        self
    }

    pub fn barrier(mut self, barrier: Arc<dyn Barrier>) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub fn workers(mut self, workers: Workers) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn handle_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Endpoints {
        let workers = self
            .workers
            .unwrap_or_else(|| Workers::new(workers::Config::default()));
        let registrations = self.registrations.unwrap_or_else(|| {
            Registrations::new(self.node.id.clone(), crate::signature::Signer::new(""))
        });
        let barrier = self
            .barrier
            .unwrap_or_else(|| Arc::new(LocalBarrier::new()));
        let mut node = self.node;
        let locals: BTreeMap<String, Arc<LocalEndpoint>> = self
            .services
            .into_iter()
            .map(|service| {
                (
                    service.name().to_string(),
                    Arc::new(LocalEndpoint::new(service, workers.clone())),
                )
            })
            .collect();
        node.services = locals.keys().cloned().collect();

        Endpoints {
            inner: Arc::new(Inner {
                node,
                locals,
                registrations,
                barrier,
                workers,
                timeout: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::versions::Version;

    struct Slow {
        entered: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Slow {
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
            argument: Argument,
        ) -> Result<Argument, CodeError> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(argument)
        }
    }

    struct Internal;

    #[async_trait]
    impl Service for Internal {
        fn name(&self) -> &str {
            "secrets"
        }

        fn internal(&self) -> bool {
            true
        }

        fn document(&self) -> Document {
            Document::new("secrets", "internal", Version::new(1, 0, 0)).internal()
        }

        async fn handle(
            &self,
            _ctx: Context,
            _fn_name: &str,
            _argument: Argument,
        ) -> Result<Argument, CodeError> {
            Argument::new(&"classified")
        }
    }

    fn node() -> Node {
        Node {
            id: "self".to_string(),
            name: "app".to_string(),
            version: Version::new(1, 2, 0),
            address: "127.0.0.1:80".to_string(),
            services: Vec::new(),
        }
    }

    fn request(body: &[u8]) -> Request {
        Request::new(
            "slow",
            "sleep",
            Argument::from_raw(body.to_vec()).unwrap(),
        )
        .with_device("d1", "127.0.0.1")
    }

    #[tokio::test]
    async fn test_handle_collapses_equal_fingerprints() {
        let entered = Arc::new(AtomicUsize::new(0));
        let endpoints = Endpoints::builder(node())
            .mount(Arc::new(Slow {
                entered: entered.clone(),
            }))
            .build();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let endpoints = endpoints.clone();
            handles.push(tokio::spawn(async move {
                endpoints
                    .handle(&Context::background(), request(br#"{"ms":100}"#))
                    .await
            }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.bytes(), br#"{"ms":100}"#);
        }
        assert_eq!(entered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_run_separately() {
        let entered = Arc::new(AtomicUsize::new(0));
        let endpoints = Endpoints::builder(node())
            .mount(Arc::new(Slow {
                entered: entered.clone(),
            }))
            .build();

        let first = {
            let endpoints = endpoints.clone();
            tokio::spawn(async move {
                endpoints
                    .handle(&Context::background(), request(br#"{"ms":1}"#))
                    .await
            })
        };
        let second = {
            let endpoints = endpoints.clone();
            tokio::spawn(async move {
                endpoints
                    .handle(&Context::background(), request(br#"{"ms":2}"#))
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_service_is_terminal() {
        let endpoints = Endpoints::builder(node()).build();
        let err = endpoints
            .handle(
                &Context::background(),
                Request::new("nope", "x", Argument::empty()).with_device("d1", ""),
            )
            .await
            .unwrap_err();
        assert_eq!(err.name, "not_found");
    }

    #[tokio::test]
    async fn test_internal_service_is_hidden_externally() {
        let endpoints = Endpoints::builder(node()).mount(Arc::new(Internal)).build();

        let err = endpoints
            .handle(
                &Context::background(),
                Request::new("secrets", "read", Argument::empty()).with_device("d1", ""),
            )
            .await
            .unwrap_err();
        assert_eq!(err.name, "not_found");

        // A verified peer request reaches it.
        let value = endpoints
            .handle(
                &Context::background(),
                Request::new("secrets", "read", Argument::empty())
                    .with_device("peer", "")
                    .with_internal(true),
            )
            .await
            .unwrap();
        assert_eq!(value.decode::<String>().unwrap(), "classified");
    }

    #[tokio::test]
    async fn test_version_mismatch_falls_through_to_registry() {
        let endpoints = Endpoints::builder(node())
            .mount(Arc::new(Internal))
            .build();

        // Local version is 1.2.0; requiring 2.x skips the local endpoint
        // and, with no peers, resolves to nothing.
        let err = endpoints
            .handle(
                &Context::background(),
                Request::new("secrets", "read", Argument::empty())
                    .with_device("peer", "")
                    .with_internal(true)
                    .with_accepted_versions("2.0.0,".parse().unwrap()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.name, "not_found");
    }

    #[tokio::test]
    async fn test_exact_id_resolution() {
        let endpoints = Endpoints::builder(node())
            .mount(Arc::new(Internal))
            .build();
        let ctx = Context::background();

        // Exact self lookup returns the local endpoint without the
        // internal-access check applying to peer routing.
        let trusted = ctx.with_request(Arc::new(
            Request::new("secrets", "read", Argument::empty()).with_internal(true),
        ));
        assert!(endpoints
            .get(&trusted, "secrets", &GetOptions::exact("self"))
            .is_ok());

        // Exact peer routing is an internal capability.
        let err = endpoints
            .get(&ctx, "secrets", &GetOptions::exact("other-node"))
            .unwrap_err();
        assert_eq!(err.name, "forbidden");

        // A trusted caller asking for an unknown peer gets not-found.
        let err = endpoints
            .get(&trusted, "secrets", &GetOptions::exact("other-node"))
            .unwrap_err();
        assert_eq!(err.name, "not_found");
    }

    #[tokio::test]
    async fn test_handle_timeout() {
        let endpoints = Endpoints::builder(node())
            .mount(Arc::new(Slow {
                entered: Arc::new(AtomicUsize::new(0)),
            }))
            .handle_timeout(Duration::from_millis(30))
            .build();

        let err = endpoints
            .handle(&Context::background(), request(br#"{"ms":100}"#))
            .await
            .unwrap_err();
        assert_eq!(err.name, "timeout");
    }
}

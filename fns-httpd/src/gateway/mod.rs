pub mod application;
pub mod cluster;
pub mod services;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::http::header::{HeaderName, CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_NONE_MATCH, PRAGMA};
use axum::http::Method;
use axum::middleware as axum_middleware;
use axum::routing::{get, post};
use axum::Router;
use localtime::LocalTime;
use tower_http::cors::{self, CorsLayer};

use fns::barrier::Barrier;
use fns::cluster::Node;
use fns::services::Document;
use fns::shared::Locker;
use fns::{
    workers, ClusterBarrier, CodeError, Config, Endpoints, LocalBarrier, Registrations, Runtime,
    Service, Shared, Signer, Version, Workers,
};

use crate::middleware;
use crate::proxy;

/// Gateway lifecycle phase; invocations are gated on it.
const STARTING: u8 = 0;
const SERVING: u8 = 1;
const DRAINING: u8 = 2;

/// Everything the handlers share: the runtime wiring, the mounted
/// documents and the gateway lifecycle state.
#[derive(Clone)]
pub struct Context {
    pub(crate) runtime: Runtime,
    pub(crate) endpoints: Endpoints,
    pub(crate) shared: Shared,
    pub(crate) signer: Signer,
    pub(crate) config: Arc<Config>,
    pub(crate) launch: LocalTime,
    pub(crate) documents: Arc<BTreeMap<String, Document>>,
    pub(crate) peer_documents: Arc<tokio::sync::Mutex<Option<proxy::DocumentsSnapshot>>>,
    pub(crate) leases: Arc<tokio::sync::Mutex<HashMap<String, Box<dyn Locker>>>>,
    pub(crate) phase: Arc<AtomicU8>,
    pub(crate) proxy: bool,
}

impl Context {
    /// Assemble the in-process runtime: signer, pool, shared substrate,
    /// barrier, registry and dispatcher. The cluster itself is joined by
    /// the caller once the listener is up.
    pub fn new(
        config: Arc<Config>,
        address: impl Into<String>,
        services: Vec<Arc<dyn Service>>,
        proxy: bool,
    ) -> Result<Self, CodeError> {
        let version: Version = config.version.parse()?;
        let node = Node {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name.clone(),
            version,
            address: address.into(),
            services: Vec::new(),
        };
        let signer = Signer::new(&config.runtime.secret_key);
        let workers = Workers::new(workers::Config {
            max_workers: config.runtime.max_workers,
            max_idle: config.runtime.worker_max_idle(),
        });
        let shared = match &config.cluster.shared.remote {
            Some(remote) => Shared::remote(&remote.address, signer.clone(), node.id.clone()),
            None => Shared::local(64 * 1024 * 1024),
        };
        let barrier: Arc<dyn Barrier> =
            if !config.cluster.kind.is_empty() && !config.cluster.shared.barrier_disabled {
                Arc::new(ClusterBarrier::new(
                    shared.clone(),
                    config.cluster.shared.barrier_ttl(),
                ))
            } else {
                Arc::new(LocalBarrier::new())
            };
        let registrations = Registrations::new(node.id.clone(), signer.clone());

        let mut builder = Endpoints::builder(node)
            .workers(workers.clone())
            .barrier(barrier)
            .registrations(registrations)
            .handle_timeout(config.runtime.handle_timeout());
        for service in services {
            builder = builder.mount(service);
        }
        let endpoints = builder.build();

        let runtime = Runtime::new(
            endpoints.node().clone(),
            signer.clone(),
            workers,
            shared.clone(),
        );
        runtime.install_endpoints(endpoints.clone());
        let documents = Arc::new(endpoints.documents());

        Ok(Self {
            runtime,
            endpoints,
            shared,
            signer,
            config,
            launch: LocalTime::now(),
            documents,
            peer_documents: Arc::new(tokio::sync::Mutex::new(None)),
            leases: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            phase: Arc::new(AtomicU8::new(STARTING)),
            proxy,
        })
    }

    pub fn node(&self) -> &Node {
        self.endpoints.node()
    }

    pub fn registrations(&self) -> &Registrations {
        self.endpoints.registrations()
    }

    pub fn set_serving(&self) {
        self.phase.store(SERVING, Ordering::SeqCst);
    }

    pub fn set_draining(&self) {
        self.phase.store(DRAINING, Ordering::SeqCst);
    }

    pub fn phase_name(&self) -> &'static str {
        match self.phase.load(Ordering::SeqCst) {
            SERVING => "serving",
            DRAINING => "draining",
            _ => "starting",
        }
    }

    /// Gate an invocation on the lifecycle phase.
    pub fn gate(&self) -> Result<(), CodeError> {
        match self.phase.load(Ordering::SeqCst) {
            SERVING => Ok(()),
            DRAINING => Err(CodeError::unavailable("gateway is draining")),
            _ => Err(CodeError::too_early("gateway is not ready yet")),
        }
    }

    /// Base call context carrying the runtime.
    pub fn base(&self) -> fns::Context {
        fns::Context::background().with_runtime(self.runtime.clone())
    }
}

/// Assemble the full route table. One router serves both modes; invocation
/// handlers branch on `ctx.proxy`.
pub fn router(ctx: Context) -> Router {
    let invoke = Router::new()
        .route(
            "/services/:service/:fn",
            post(services::invoke_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            ctx.clone(),
            middleware::idempotent,
        ))
        .layer(axum_middleware::from_fn_with_state(
            ctx.clone(),
            middleware::rate_limit,
        ))
        .layer(axum_middleware::from_fn_with_state(
            ctx.clone(),
            middleware::request_cache,
        ))
        .with_state(ctx.clone());

    Router::new()
        .route("/application/health", get(application::health_handler))
        .route("/application/status", get(application::status_handler))
        .route("/services/names", get(services::names_handler))
        .route("/services/documents", get(services::documents_handler))
        .route("/services/openapi", get(services::openapi_handler))
        .route("/cluster/nodes", post(cluster::nodes_handler))
        .route("/cluster/shared", post(cluster::shared_handler))
        .with_state(ctx.clone())
        .merge(invoke)
        .layer(cors_layer(&ctx))
        .layer(axum_middleware::from_fn(middleware::preflight_status))
}

fn cors_layer(ctx: &Context) -> CorsLayer {
    let fns_headers = [
        fns::header::ID,
        fns::header::NAME,
        fns::header::VERSION,
        fns::header::REQUEST_ID,
        fns::header::REQUEST_SIGNATURE,
        fns::header::REQUEST_INTERNAL,
        fns::header::REQUEST_TIMEOUT,
        fns::header::REQUEST_VERSION,
        fns::header::HANDLE_LATENCY,
        fns::header::DEVICE_ID,
        fns::header::DEVICE_IP,
        fns::header::PROXY_NODE,
    ];
    let allow: Vec<HeaderName> = fns_headers
        .iter()
        .map(|name| header_name(name))
        .chain([CONTENT_TYPE, CACHE_CONTROL, IF_NONE_MATCH, PRAGMA])
        .collect();
    let expose: Vec<HeaderName> = fns_headers
        .iter()
        .map(|name| header_name(name))
        .chain([ETAG, header_name(fns::header::CLEAR_SITE_DATA)])
        .collect();

    let cors_config = &ctx.config.transport.cors;
    let mut layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(cors::AllowHeaders::list(allow))
        .expose_headers(cors::ExposeHeaders::list(expose))
        .max_age(std::time::Duration::from_secs(cors_config.max_age_seconds));
    let any_origin = cors_config.allowed_origins.iter().any(|o| o == "*");
    layer = if any_origin {
        layer.allow_origin(cors::Any)
    } else {
        let origins = cors_config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok());
        layer.allow_origin(cors::AllowOrigin::list(origins))
    };
    // Credentials cannot be combined with a wildcard origin.
    if cors_config.allow_credentials && !any_origin {
        layer = layer.allow_credentials(true);
    }
    layer
}

fn header_name(name: &str) -> HeaderName {
    HeaderName::from_bytes(name.as_bytes()).expect("static header names are valid")
}

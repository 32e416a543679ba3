//! fns HTTP gateway daemon: turns external HTTP into runtime requests,
//! speaks the signed internal envelope between peers, and optionally runs
//! as a serviceless proxy in front of a cluster.
#![allow(clippy::too_many_arguments)]

pub mod error;
pub mod gateway;
mod middleware;
mod proxy;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::Request;
use axum::response::Response;
use tower_http::trace::TraceLayer;
use tracing::Span;

use fns::cluster::Cluster;
use fns::Service;

pub use gateway::{router, Context};

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    /// Directory holding `fns.json` (and profile overlays); defaults
    /// apply when absent.
    pub config: Option<PathBuf>,
    /// Serve the proxy surface instead of local services.
    pub proxy: bool,
}

/// Run the gateway until interrupted: assemble the runtime, join the
/// configured cluster and serve.
pub async fn run(
    options: Options,
    config: fns::Config,
    services: Vec<Arc<dyn Service>>,
) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let listener = tokio::net::TcpListener::bind(options.listen)
        .await
        .with_context(|| format!("binding {}", options.listen))?;
    let local_addr = listener.local_addr()?;
    tracing::info!("listening on http://{local_addr}");

    let ctx = Context::new(
        config.clone(),
        local_addr.to_string(),
        services,
        options.proxy,
    )?;

    // Cluster wiring: join, then keep the peer mirror fresh in the
    // background.
    let mut cluster: Option<Arc<dyn Cluster>> = None;
    let mut refresh = None;
    if !config.cluster.kind.is_empty() {
        let built = fns::cluster::build(
            &config.cluster,
            ctx.signer.clone(),
            ctx.shared.clone(),
        )?;
        built
            .join(&ctx.base(), ctx.node().clone())
            .await
            .context("joining the cluster")?;
        refresh = Some(ctx.registrations().spawn_refresh_loop(
            built.clone(),
            config.cluster.fetch_members_interval(),
        ));
        cluster = Some(built);
    }

    ctx.set_serving();

    let app = router(ctx.clone())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri()
                    )
                })
                .on_response(|response: &Response, latency: Duration, _span: &Span| {
                    tracing::info!("{} {:?}", response.status(), latency);
                }),
        )
        .into_make_service_with_connect_info::<SocketAddr>();

    let drain = ctx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutting down..");
            drain.set_draining();
        })
        .await?;

    // Drain: stop the refresh loop, wait out in-flight work, leave.
    if let Some(refresh) = refresh {
        refresh.abort();
    }
    ctx.runtime.workers().close().await;
    if let Some(cluster) = cluster {
        cluster.leave(&ctx.base()).await.ok();
    }
    tracing::debug!("gateway shutdown completed");

    Ok(())
}

use std::net::SocketAddr;
use std::process;
use std::thread;

use fns_httpd as httpd;
use tracing::dispatcher::Dispatch;

mod logger {
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .finish()
    }
}

fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    tracing::dispatcher::set_global_default(Dispatch::new(logger::subscriber()))
        .expect("Global logger hasn't already been set");

    tracing::info!("version {}-{}", env!("CARGO_PKG_VERSION"), env!("GIT_HEAD"));

    let config = match &options.config {
        Some(dir) => fns::Config::load(dir)?,
        None => fns::Config::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(scheduler_threads(&config.runtime.auto_max_procs))
        .enable_all()
        .build()?;

    match runtime.block_on(httpd::run(options, config, Vec::new())) {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Host parallelism clamped to the configured bounds; zero leaves a side
/// open.
fn scheduler_threads(procs: &fns::config::AutoMaxProcs) -> usize {
    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let min = procs.min.max(1);
    let max = if procs.max == 0 { usize::MAX } else { procs.max };
    available.clamp(min, max.max(min))
}

/// Parse command-line arguments into gateway options.
fn parse_options() -> Result<httpd::Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut config = None;
    let mut proxy = false;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr: SocketAddr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("config") | Short('c') => {
                config = Some(parser.value()?.into());
            }
            Long("proxy") => {
                proxy = true;
            }
            Long("help") | Short('h') => {
                println!("usage: fns-httpd [--listen <addr>] [--config <dir>] [--proxy]..");
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(httpd::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
        config,
        proxy,
    })
}

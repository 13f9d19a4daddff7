mod cache;
mod config;
mod outbox;
mod request;
mod server;
mod stats;
mod wire;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{
    ProxyConfig, DEFAULT_LISTEN_PORT, DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_TIMEOUT_MS,
    DEFAULT_UPSTREAM_ADDR, DEFAULT_UPSTREAM_PORT,
};
use crate::server::Proxy;

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwarding DNS proxy: relays every query to one upstream resolver", long_about = None)]
struct Args {
    /// UDP port to listen on
    #[arg(default_value_t = DEFAULT_LISTEN_PORT)]
    listen_port: u16,
    /// Upstream resolver to forward queries to
    #[arg(default_value = DEFAULT_UPSTREAM_ADDR)]
    upstream_addr: String,
    /// Upstream resolver port
    #[arg(default_value_t = DEFAULT_UPSTREAM_PORT)]
    upstream_port: u16,
    /// Drop replies that arrive later than this
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,
    /// How often expired pending queries are evicted
    #[arg(long = "sweep-interval-ms", default_value_t = DEFAULT_SWEEP_INTERVAL_MS)]
    sweep_interval_ms: u64,
    /// Serve repeated queries from a best-effort response cache
    #[arg(long = "cache", default_value_t = false)]
    cache: bool,
    /// Log every request and reply as it is handled
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let upstream = config::resolve_upstream(&args.upstream_addr, args.upstream_port).await?;
    let cfg = ProxyConfig {
        listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.listen_port),
        upstream,
        timeout: Duration::from_millis(args.timeout_ms),
        sweep_interval: Duration::from_millis(args.sweep_interval_ms),
        cache: args.cache,
    };

    let proxy = Arc::new(Proxy::bind(cfg).context("start proxy")?);
    let listen = proxy.local_addr().context("query listen address")?;
    info!(listen = %listen, upstream = %upstream, cache = args.cache, "dns proxy started");

    let workers = Arc::clone(&proxy).spawn_workers();

    let signal = wait_for_shutdown_signal().await?;
    info!(signal, "received shutdown signal, draining workers");
    proxy.begin_shutdown();
    for handle in workers {
        let _ = handle.await;
    }

    let snap = proxy.stats().snapshot();
    info!(
        packets_in = snap.packets_in,
        packets_out = snap.packets_out,
        requests = snap.requests,
        served = snap.served,
        timeouts = snap.timeouts,
        processing = snap.processing,
        "final statistics"
    );
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// Block until one of the shutdown signals fires, returning its name.
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigill = signal(SignalKind::from_raw(libc::SIGILL)).context("install SIGILL handler")?;
    let mut sigabrt =
        signal(SignalKind::from_raw(libc::SIGABRT)).context("install SIGABRT handler")?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigill.recv() => "SIGILL",
        _ = sigabrt.recv() => "SIGABRT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    Ok("ctrl-c")
}

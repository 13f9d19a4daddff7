use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::net::lookup_host;

pub const DEFAULT_LISTEN_PORT: u16 = 53;
pub const DEFAULT_UPSTREAM_ADDR: &str = "8.8.8.8";
pub const DEFAULT_UPSTREAM_PORT: u16 = 53;
/// How long until a pending request times out.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
/// How often the sweeper scans for timeouts.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Everything the proxy needs at runtime, assembled once from the CLI.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Client-facing bind address.
    pub listen: SocketAddr,
    /// Resolved upstream resolver; the only peer egress accepts replies
    /// from.
    pub upstream: SocketAddr,
    /// A reply older than this is never delivered.
    pub timeout: Duration,
    /// Sweeper wake-up period.
    pub sweep_interval: Duration,
    /// Serve repeated queries from the response cache.
    pub cache: bool,
}

/// Resolve the upstream resolver once, up front. IPv4 results are
/// preferred; resolution failure is fatal, nothing can be forwarded
/// without an upstream.
pub async fn resolve_upstream(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .with_context(|| format!("resolve upstream dns server {host}"))?
        .collect();
    addrs
        .iter()
        .find(|addr| matches!(addr.ip(), IpAddr::V4(_)))
        .or_else(|| addrs.first())
        .copied()
        .with_context(|| format!("upstream dns server {host} resolved to no addresses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_literal_ipv4() {
        let addr = resolve_upstream("127.0.0.1", 53).await.expect("resolve");
        assert_eq!(addr, "127.0.0.1:53".parse().unwrap());
    }

    #[tokio::test]
    async fn carries_port_through_resolution() {
        let addr = resolve_upstream("127.0.0.1", 5353).await.expect("resolve");
        assert_eq!(addr.port(), 5353);
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        assert!(resolve_upstream("no-such-host.invalid.", 53).await.is_err());
    }
}

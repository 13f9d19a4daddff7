use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use hickory_proto::rr::RecordType;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::outbox::{IdAllocator, Outbox};
use crate::request::Request;
use crate::stats::Stats;
use crate::wire;

/// Accept no packets over this size (classic DNS over UDP limit).
pub const MAX_PACKET_SIZE: usize = 512;
/// Receive buffer for both sockets. Oversized datagrams are read whole so
/// their length can be checked, then discarded.
const RECV_BUFFER_SIZE: usize = 4096;
/// Kernel socket buffer size, sized against reply bursts.
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Shared state of the proxy: the two sockets, the correlation
/// structures, the counters, and the shutdown token. Each pipeline worker
/// holds an `Arc` to this; the coordinator in `main` owns the workers.
pub struct Proxy {
    cfg: ProxyConfig,
    /// Read by ingress, written by egress (and by the processor on cache
    /// hits). Per-datagram atomicity comes from the kernel.
    client_socket: UdpSocket,
    /// Written by the processor, read by egress. Bound to an ephemeral
    /// port.
    upstream_socket: UdpSocket,
    outbox: Outbox,
    ids: IdAllocator,
    stats: Stats,
    cache: Option<ResponseCache>,
    shutdown: CancellationToken,
}

/// Build a UDP socket through socket2 so the kernel buffers can be
/// enlarged before binding, then hand it to tokio.
fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(err) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    UdpSocket::from_std(socket.into()).context("register socket with tokio")
}

impl Proxy {
    /// Bind both sockets and assemble the shared state. Everything here
    /// is fatal; after this point nothing is.
    pub fn bind(cfg: ProxyConfig) -> Result<Proxy> {
        let client_socket = bind_udp(cfg.listen).context("bind client socket")?;
        let upstream_bind: SocketAddr = if cfg.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let upstream_socket = bind_udp(upstream_bind).context("bind upstream socket")?;
        let cache = cfg.cache.then(ResponseCache::new);
        Ok(Proxy {
            cfg,
            client_socket,
            upstream_socket,
            outbox: Outbox::new(),
            ids: IdAllocator::new(),
            stats: Stats::default(),
            cache,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.client_socket.local_addr()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Ask every worker to wind down; each observes the token at the top
    /// of its loop.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Launch one worker per pipeline stage. The handles complete once
    /// shutdown has been signalled.
    pub fn spawn_workers(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        vec![
            tokio::spawn(Arc::clone(&self).run_ingress(inbox_tx)),
            tokio::spawn(Arc::clone(&self).run_processor(inbox_rx)),
            tokio::spawn(Arc::clone(&self).run_egress()),
            tokio::spawn(self.run_sweeper()),
        ]
    }

    /// Stage 1: read client datagrams and queue them raw. No parsing
    /// happens here, so the socket is drained as fast as possible.
    async fn run_ingress(self: Arc<Self>, inbox: mpsc::UnboundedSender<Request>) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                recv = self.client_socket.recv_from(&mut buf) => match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        error!(error = %err, "client socket recv failed");
                        continue;
                    }
                },
            };
            if len > MAX_PACKET_SIZE {
                warn!(len, peer = %peer, "oversized packet discarded");
                continue;
            }
            self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
            let req = Request::new(BytesMut::from(&buf[..len]), peer);
            if inbox.send(req).is_err() {
                // Processor gone; only happens during shutdown.
                break;
            }
        }
    }

    /// Stage 2: decode, allocate the upstream-facing ID, record the
    /// pending entry, forward upstream.
    async fn run_processor(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Request>) {
        loop {
            let req = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                req = inbox.recv() => match req {
                    Some(req) => req,
                    None => break,
                },
            };
            self.handle_query(req).await;
        }
    }

    async fn handle_query(&self, mut req: Request) {
        let parsed = match wire::decode_query(&req.raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(peer = %req.client_addr, error = %err, "dropping undecodable query");
                return;
            }
        };
        if parsed.header.response {
            warn!(peer = %req.client_addr, id = parsed.header.id, "response packet on the client socket, dropped");
            return;
        }
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        req.qname = parsed.qname;

        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&req.qname) {
                let mut payload = BytesMut::from(hit.as_ref());
                wire::write_id(&mut payload, parsed.header.id);
                debug!(qname = %req.qname, id = parsed.header.id, "served from cache");
                self.stats.served.fetch_add(1, Ordering::Relaxed);
                self.send_to_client(&payload, req.client_addr).await;
                return;
            }
        }

        req.client_id = wire::read_id(&req.raw);
        req.proxy_id = self.ids.next();
        wire::write_id(&mut req.raw, req.proxy_id);
        debug!(
            qname = %req.qname,
            qtype = ?RecordType::from(parsed.qtype),
            client_id = req.client_id,
            proxy_id = req.proxy_id,
            "forwarding query upstream"
        );

        // Insert before sending so a fast reply cannot arrive ahead of
        // the entry it has to match.
        let payload = req.raw.clone();
        if let Some(evicted) = self.outbox.insert(req) {
            // A full ID wrap landed on a slot that was still live; the
            // older query is abandoned.
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            warn!(qname = %evicted.qname, proxy_id = evicted.proxy_id, "pending entry evicted by id reuse");
        }
        match self.upstream_socket.send_to(&payload, self.cfg.upstream).await {
            Ok(_) => {
                self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                // Not retried; the entry ages out through the sweeper.
                error!(error = %err, upstream = %self.cfg.upstream, "sendto upstream failed");
            }
        }
    }

    /// Stage 3: read upstream replies, match them to pending entries,
    /// restore the client's ID, and relay. Enforces the source check and
    /// the passive timeout.
    async fn run_egress(self: Arc<Self>) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                recv = self.upstream_socket.recv_from(&mut buf) => match recv {
                    Ok(recv) => recv,
                    Err(err) => {
                        error!(error = %err, "upstream socket recv failed");
                        continue;
                    }
                },
            };
            if len > MAX_PACKET_SIZE {
                warn!(len, peer = %peer, "oversized packet discarded");
                continue;
            }
            // The only spoofing defence there is: replies must come from
            // the resolver we forwarded to, address and port both.
            if peer != self.cfg.upstream {
                warn!(peer = %peer, expected = %self.cfg.upstream, "reply from unexpected source, ignored");
                continue;
            }
            self.handle_reply(&mut buf[..len]).await;
        }
    }

    async fn handle_reply(&self, raw: &mut [u8]) {
        let parsed = match wire::decode_query(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "dropping undecodable reply");
                return;
            }
        };
        if !parsed.header.response {
            warn!(id = parsed.header.id, "question packet on the upstream socket, dropped");
            return;
        }
        self.stats.packets_in.fetch_add(1, Ordering::Relaxed);

        let proxy_id = wire::read_id(raw);
        let Some(req) = self.outbox.take(proxy_id) else {
            // Late reply after a timeout, or a stray. Both are normal.
            debug!(proxy_id, "no pending entry for reply");
            return;
        };

        let elapsed = req.forwarded_at.elapsed();
        if elapsed >= self.cfg.timeout {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!(
                qname = %req.qname,
                elapsed_ms = elapsed.as_millis() as u64,
                "passive timeout, reply dropped"
            );
            return;
        }

        wire::write_id(raw, req.client_id);
        self.stats.served.fetch_add(1, Ordering::Relaxed);
        self.send_to_client(raw, req.client_addr).await;
        debug!(
            qname = %req.qname,
            qtype = ?RecordType::from(parsed.qtype),
            elapsed_ms = elapsed.as_millis() as u64,
            "reply relayed to client"
        );
        if let Some(cache) = &self.cache {
            cache.put(&req.qname, Bytes::copy_from_slice(raw));
        }
    }

    /// Stage 4: periodic eviction of pending entries past the deadline.
    /// The passive check in egress is the authoritative cutoff; this pass
    /// keeps the table from accumulating entries that never got a reply.
    async fn run_sweeper(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.cfg.sweep_interval) => {
                    let expired = self.outbox.sweep(self.cfg.timeout);
                    if expired > 0 {
                        self.stats.timeouts.fetch_add(expired as u64, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn send_to_client(&self, payload: &[u8], addr: SocketAddr) {
        match self.client_socket.send_to(payload, addr).await {
            Ok(_) => {
                self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => error!(error = %err, client = %addr, "sendto client failed"),
        }
    }
}

use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;

/// A client query moving through the pipeline.
///
/// Constructed by ingress, filled in by the processor, owned by the
/// outbox while the upstream reply is pending, then consumed by egress
/// (served) or the sweeper (timed out). Exactly one stage owns a request
/// at any time.
pub struct Request {
    /// Original datagram bytes; the ID field is rewritten in place before
    /// forwarding, everything else goes upstream verbatim.
    pub raw: BytesMut,
    /// Where the query came from and where the reply goes back to.
    pub client_addr: SocketAddr,
    /// Transaction ID the client chose.
    pub client_id: u16,
    /// Transaction ID this proxy sent upstream.
    pub proxy_id: u16,
    /// First question name, dotted form.
    pub qname: String,
    /// Stamped by the outbox just before the forward.
    pub forwarded_at: Instant,
}

impl Request {
    pub fn new(raw: BytesMut, client_addr: SocketAddr) -> Self {
        Self {
            raw,
            client_addr,
            client_id: 0,
            proxy_id: 0,
            qname: String::new(),
            forwarded_at: Instant::now(),
        }
    }
}

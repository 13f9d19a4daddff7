use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::request::Request;

/// One slot per possible 16-bit transaction ID.
const ID_SPACE: usize = 1 << 16;

/// Issues the transaction IDs this proxy sends upstream.
///
/// A monotonic counter over `[1, 65535]`; 0 is never produced. Uniqueness
/// against the live pending set is not checked: a collision requires a
/// full wrap while the old entry is still in flight, which takes a
/// sustained load of roughly 32k outstanding queries inside the timeout
/// window. When it does happen the outbox evicts the older entry.
pub struct IdAllocator {
    counter: AtomicU16,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU16::new(0),
        }
    }

    pub fn next(&self) -> u16 {
        let mut cur = self.counter.load(Ordering::Relaxed);
        loop {
            let next = if cur == u16::MAX { 1 } else { cur + 1 };
            match self.counter.compare_exchange_weak(
                cur,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => cur = observed,
            }
        }
    }
}

/// In-flight requests awaiting an upstream reply.
///
/// Two views of the same entries under one lock: a dense table indexed by
/// the full 16-bit ID space for O(1) reply matching, and a FIFO of IDs in
/// forward order so the sweeper can expire from the oldest end and stop
/// at the first entry still inside the deadline. `take` leaves the FIFO
/// untouched; `sweep` discards stale FIFO entries whose slot has already
/// been emptied.
pub struct Outbox {
    inner: Mutex<Inner>,
}

struct Inner {
    table: Vec<Option<Request>>,
    fifo: VecDeque<u16>,
    live: usize,
}

impl Outbox {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(ID_SPACE);
        table.resize_with(ID_SPACE, || None);
        Self {
            inner: Mutex::new(Inner {
                table,
                fifo: VecDeque::new(),
                live: 0,
            }),
        }
    }

    /// Stamp the forward time and store `req` under its proxy ID. Returns
    /// the previous occupant when a wrapped ID lands on a slot that is
    /// still live; the caller accounts for it as a timeout.
    pub fn insert(&self, mut req: Request) -> Option<Request> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        req.forwarded_at = Instant::now();
        let slot = req.proxy_id as usize;
        inner.fifo.push_back(req.proxy_id);
        let evicted = inner.table[slot].replace(req);
        if evicted.is_none() {
            inner.live += 1;
        }
        evicted
    }

    /// Remove and return the request stored under `proxy_id`, if any.
    pub fn take(&self, proxy_id: u16) -> Option<Request> {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let taken = inner.table[proxy_id as usize].take();
        if taken.is_some() {
            inner.live -= 1;
        }
        taken
    }

    /// Expire requests older than `deadline`, oldest first, returning how
    /// many were evicted. The FIFO is weakly ordered by forward time, so
    /// the walk stops at the first entry still young enough.
    pub fn sweep(&self, deadline: Duration) -> usize {
        let mut inner = self.inner.lock().expect("outbox lock poisoned");
        let now = Instant::now();
        let mut expired = 0;
        let Inner { table, fifo, live } = &mut *inner;
        while let Some(&id) = fifo.front() {
            let slot = &mut table[id as usize];
            match slot {
                None => {
                    // Already served; drop the stale FIFO entry.
                    fifo.pop_front();
                }
                Some(req) if now.duration_since(req.forwarded_at) >= deadline => {
                    debug!(
                        qname = %req.qname,
                        elapsed_ms = now.duration_since(req.forwarded_at).as_millis() as u64,
                        "active timeout"
                    );
                    *slot = None;
                    *live -= 1;
                    fifo.pop_front();
                    expired += 1;
                }
                Some(_) => break,
            }
        }
        expired
    }

    /// Number of requests currently awaiting a reply.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("outbox lock poisoned").live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn req(proxy_id: u16, qname: &str) -> Request {
        let mut r = Request::new(
            BytesMut::from(&b"\x00\x00stub"[..]),
            "127.0.0.1:5353".parse().unwrap(),
        );
        r.proxy_id = proxy_id;
        r.qname = qname.to_string();
        r
    }

    #[test]
    fn allocator_starts_at_one() {
        let ids = IdAllocator::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn allocator_cycles_full_range_and_skips_zero() {
        let ids = IdAllocator::new();
        let mut last = 0u16;
        for _ in 0..u16::MAX {
            let id = ids.next();
            assert_ne!(id, 0);
            assert_eq!(id, last + 1);
            last = id;
        }
        assert_eq!(last, u16::MAX);
        // Wrap: past the end of the range, back to 1.
        assert_eq!(ids.next(), 1);
    }

    #[test]
    fn take_returns_entry_exactly_once() {
        let outbox = Outbox::new();
        outbox.insert(req(42, "example.com"));
        assert_eq!(outbox.len(), 1);
        let taken = outbox.take(42).expect("entry present");
        assert_eq!(taken.qname, "example.com");
        assert!(outbox.take(42).is_none());
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn take_of_empty_slot_is_none() {
        let outbox = Outbox::new();
        assert!(outbox.take(7).is_none());
    }

    #[test]
    fn insert_on_live_slot_evicts_prior_occupant() {
        let outbox = Outbox::new();
        assert!(outbox.insert(req(9, "old.example")).is_none());
        let evicted = outbox.insert(req(9, "new.example")).expect("evicted");
        assert_eq!(evicted.qname, "old.example");
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.take(9).expect("entry").qname, "new.example");
    }

    #[test]
    fn sweep_keeps_entries_inside_deadline() {
        let outbox = Outbox::new();
        outbox.insert(req(1, "example.com"));
        assert_eq!(outbox.sweep(Duration::from_secs(3600)), 0);
        assert!(outbox.take(1).is_some());
    }

    #[test]
    fn sweep_expires_only_aged_entries() {
        let outbox = Outbox::new();
        outbox.insert(req(1, "old.example"));
        std::thread::sleep(Duration::from_millis(30));
        outbox.insert(req(2, "young.example"));

        // Only the first entry has crossed the deadline; the walk must
        // stop at the second.
        assert_eq!(outbox.sweep(Duration::from_millis(20)), 1);
        assert_eq!(outbox.len(), 1);
        assert!(outbox.take(1).is_none());
        assert!(outbox.take(2).is_some());
    }

    #[test]
    fn sweep_pops_lazily_deleted_fifo_entries() {
        let outbox = Outbox::new();
        outbox.insert(req(1, "served.example"));
        outbox.insert(req(2, "pending.example"));
        outbox.take(1).expect("served");

        // Id 1 is still at the FIFO front but its slot is empty; the
        // sweep skips it without counting and expires id 2.
        assert_eq!(outbox.sweep(Duration::ZERO), 1);
        assert_eq!(outbox.len(), 0);
        assert_eq!(outbox.sweep(Duration::ZERO), 0);
    }

    #[test]
    fn id_wrap_under_load_replaces_oldest_entries() {
        let outbox = Outbox::new();
        let ids = IdAllocator::new();
        let mut evicted = 0;
        for _ in 0..70_000 {
            if outbox.insert(req(ids.next(), "load.example")).is_some() {
                evicted += 1;
            }
        }
        // 65 535 usable IDs; everything past that lands on a live slot.
        assert_eq!(evicted, 70_000 - 65_535);
        assert_eq!(outbox.len(), 65_535);
        // Entries that were not evicted are still retrievable.
        assert!(outbox.take(65_535).is_some());
    }
}

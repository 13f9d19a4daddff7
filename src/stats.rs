use std::sync::atomic::{AtomicU64, Ordering};

/// Run counters. Incremented with relaxed ordering outside any lock and
/// read unsynchronized for the shutdown report; a torn read across
/// counters is acceptable for end-of-run output.
#[derive(Default)]
pub struct Stats {
    /// Datagrams accepted off either socket.
    pub packets_in: AtomicU64,
    /// Datagrams sent on either socket.
    pub packets_out: AtomicU64,
    /// Queries that decoded and entered the pipeline.
    pub requests: AtomicU64,
    /// Replies delivered back to a client.
    pub served: AtomicU64,
    /// Requests dropped by passive or active timeout, or evicted by ID
    /// reuse.
    pub timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub requests: u64,
    pub served: u64,
    pub timeouts: u64,
    /// Accepted but neither served nor timed out yet.
    pub processing: u64,
}

impl Stats {
    pub fn snapshot(&self) -> Snapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let served = self.served.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        Snapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            requests,
            served,
            timeouts,
            processing: requests.saturating_sub(served + timeouts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_processing() {
        let stats = Stats::default();
        stats.requests.store(10, Ordering::Relaxed);
        stats.served.store(6, Ordering::Relaxed);
        stats.timeouts.store(3, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.processing, 1);
        assert_eq!(snap.requests, snap.served + snap.timeouts + snap.processing);
    }

    #[test]
    fn processing_saturates_instead_of_underflowing() {
        let stats = Stats::default();
        stats.served.store(2, Ordering::Relaxed);
        assert_eq!(stats.snapshot().processing, 0);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-worker counters; readable from the aggregation thread.
pub struct WorkerMetrics {
    pub req_count: AtomicU64,
    pub active_conns: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            req_count: AtomicU64::new(0),
            active_conns: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_req(&self) {
        self.req_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals kept by the fetch manager. Updated from worker threads without locking.
#[derive(Debug, Default)]
pub struct FetchStats {
    created: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    http_requests: AtomicU64,
    http_failures: AtomicU64,
    http_retries: AtomicU64,
    bytes_received: AtomicU64,
    decodes: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
}

/// A point-in-time copy of [FetchStats].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStatsSnapshot {
    pub created: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub http_requests: u64,
    pub http_failures: u64,
    pub http_retries: u64,
    pub bytes_received: u64,
    pub decodes: u64,
    /// Requests drained with pixels.
    pub completed: u64,
    /// Requests drained without pixels, for any reason other than cancellation.
    pub failed: u64,
    pub cancelled: u64,
    /// Cancellations caused by the idle or zero-priority timeouts. Also counted in `cancelled`.
    pub timeouts: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl FetchStats {
    pub(crate) fn inc_created(&self) {
        bump(&self.created);
    }

    pub(crate) fn inc_cache_hits(&self) {
        bump(&self.cache_hits);
    }

    pub(crate) fn inc_cache_misses(&self) {
        bump(&self.cache_misses);
    }

    pub(crate) fn inc_http_requests(&self) {
        bump(&self.http_requests);
    }

    pub(crate) fn inc_http_failures(&self) {
        bump(&self.http_failures);
    }

    pub(crate) fn inc_http_retries(&self) {
        bump(&self.http_retries);
    }

    pub(crate) fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn inc_decodes(&self) {
        bump(&self.decodes);
    }

    pub(crate) fn inc_completed(&self) {
        bump(&self.completed);
    }

    pub(crate) fn inc_failed(&self) {
        bump(&self.failed);
    }

    pub(crate) fn inc_cancelled(&self) {
        bump(&self.cancelled);
    }

    pub(crate) fn inc_timeouts(&self) {
        bump(&self.timeouts);
    }

    pub fn snapshot(&self) -> FetchStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FetchStatsSnapshot {
            created: get(&self.created),
            cache_hits: get(&self.cache_hits),
            cache_misses: get(&self.cache_misses),
            http_requests: get(&self.http_requests),
            http_failures: get(&self.http_failures),
            http_retries: get(&self.http_retries),
            bytes_received: get(&self.bytes_received),
            decodes: get(&self.decodes),
            completed: get(&self.completed),
            failed: get(&self.failed),
            cancelled: get(&self.cancelled),
            timeouts: get(&self.timeouts),
        }
    }
}

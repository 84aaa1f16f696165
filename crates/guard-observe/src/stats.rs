use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters exported to the shell. All monotonic except the two
/// gauges (`domains_indexed`, `leaf_cache_size`) which are set on publish.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    blocked_total: AtomicU64,
    allowed_total: AtomicU64,
    bytes_saved_estimate: AtomicU64,
    domains_indexed: AtomicU64,
    bloom_rejects: AtomicU64,
    trie_hits: AtomicU64,
    leaf_cache_size: AtomicU64,
    leaf_cache_hits: AtomicU64,
    leaf_cache_misses: AtomicU64,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub blocked_total: u64,
    pub allowed_total: u64,
    pub bytes_saved_estimate: u64,
    pub domains_indexed: u64,
    pub bloom_rejects: u64,
    pub trie_hits: u64,
    pub leaf_cache_size: u64,
    pub leaf_cache_hits: u64,
    pub leaf_cache_misses: u64,
    pub connections_total: u64,
    pub connections_active: u64,
}

impl StatsRegistry {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocked_total: self.blocked_total.load(Ordering::Relaxed),
            allowed_total: self.allowed_total.load(Ordering::Relaxed),
            bytes_saved_estimate: self.bytes_saved_estimate.load(Ordering::Relaxed),
            domains_indexed: self.domains_indexed.load(Ordering::Relaxed),
            bloom_rejects: self.bloom_rejects.load(Ordering::Relaxed),
            trie_hits: self.trie_hits.load(Ordering::Relaxed),
            leaf_cache_size: self.leaf_cache_size.load(Ordering::Relaxed),
            leaf_cache_hits: self.leaf_cache_hits.load(Ordering::Relaxed),
            leaf_cache_misses: self.leaf_cache_misses.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
        }
    }

    pub fn record_blocked(&self, bytes_saved_estimate: u64) {
        self.blocked_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_saved_estimate
            .fetch_add(bytes_saved_estimate, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.allowed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bloom_reject(&self) {
        self.bloom_rejects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trie_hit(&self) {
        self.trie_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaf_cache_hit(&self) {
        self.leaf_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leaf_cache_miss(&self) {
        self.leaf_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_leaf_cache_size(&self, size: u64) {
        self.leaf_cache_size.store(size, Ordering::Relaxed);
    }

    pub fn set_domains_indexed(&self, count: u64) {
        self.domains_indexed.store(count, Ordering::Relaxed);
    }

    pub fn record_connection_open(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_close(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(1))
            });
    }
}

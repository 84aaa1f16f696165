//! Shared, read-mostly state behind every connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guard_ca::CertificateAuthority;
use guard_observe::{Event, EventSink, StatsRegistry};

use crate::bypass::BypassList;
use crate::delegate::ProxyDelegate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub max_request_head_bytes: usize,
    pub http2_enabled: bool,
    /// When false, only `extra_origin_roots_der` anchor origin trust; the
    /// chain is still fully verified either way.
    pub origin_verify_system_trust: bool,
    pub extra_origin_roots_der: Vec<Vec<u8>>,
    pub bypass_patterns: Vec<String>,
    pub tls_handshake_timeout: Duration,
    pub origin_connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            listen_port: 8899,
            max_request_head_bytes: crate::http::DEFAULT_MAX_HEAD_BYTES,
            http2_enabled: true,
            origin_verify_system_trust: true,
            extra_origin_roots_der: Vec::new(),
            bypass_patterns: Vec::new(),
            tls_handshake_timeout: Duration::from_secs(30),
            origin_connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

pub(crate) struct ProxyRuntime {
    pub config: ProxyConfig,
    pub ca: Arc<CertificateAuthority>,
    pub bypass: BypassList,
    pub delegate: ProxyDelegate,
    pub events: Arc<dyn EventSink>,
    pub stats: Arc<StatsRegistry>,
    next_flow_id: AtomicU64,
}

impl ProxyRuntime {
    pub(crate) fn new(
        config: ProxyConfig,
        ca: Arc<CertificateAuthority>,
        bypass: BypassList,
        delegate: ProxyDelegate,
        events: Arc<dyn EventSink>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            config,
            ca,
            bypass,
            delegate,
            events,
            stats,
            next_flow_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn allocate_flow_id(&self) -> u64 {
        self.next_flow_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    pub(crate) fn publish_leaf_cache_stats(&self) {
        let metrics = self.ca.cache_metrics();
        self.stats.set_leaf_cache_size(metrics.size);
        // The registry counters are monotonic; replay the deltas.
        let snapshot = self.stats.snapshot();
        for _ in snapshot.leaf_cache_hits..metrics.hits {
            self.stats.record_leaf_cache_hit();
        }
        for _ in snapshot.leaf_cache_misses..metrics.misses {
            self.stats.record_leaf_cache_miss();
        }
    }
}

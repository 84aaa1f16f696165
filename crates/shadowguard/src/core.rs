//! Explicit wiring of the four subsystems. The shell constructs a `Core`
//! with its collaborators; nothing in here is a global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use guard_ca::{CaConfig, CertificateAuthority, KeyStore};
use guard_filter::{RuleCompileError, RuleSet, RuleSourceText};
use guard_inspect::{Decision, IpFamily};
use guard_observe::{Event, EventSink, EventType, FlowContext, FlowTransport, StatsRegistry};
use guard_proxy::{ProxyConfig, ProxyDelegate, ProxyError, ProxyHandle, ProxyServer};
use thiserror::Error;

use crate::config::{Config, ConfigError, RuleSourceConfig};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ca(#[from] guard_ca::CaError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    RuleCompile(#[from] RuleCompileError),
    #[error("proxy is already running")]
    ProxyAlreadyRunning,
}

/// Ordered rule text made available to the core; the shell decides where
/// the blobs come from.
pub trait RuleSource: Send + Sync {
    fn load(&self) -> Vec<RuleSourceText>;
}

/// The built-in source: enabled entries of the configuration, in order.
pub struct ConfigRuleSource {
    entries: Vec<RuleSourceConfig>,
}

impl ConfigRuleSource {
    pub fn new(entries: Vec<RuleSourceConfig>) -> Self {
        Self { entries }
    }
}

impl RuleSource for ConfigRuleSource {
    fn load(&self) -> Vec<RuleSourceText> {
        self.entries
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| RuleSourceText {
                id: entry.id.clone(),
                text: entry.text_blob.clone(),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub generation: u64,
    pub domains_indexed: usize,
    pub skipped_lines: usize,
}

pub struct Core {
    ca: Arc<CertificateAuthority>,
    stats: Arc<StatsRegistry>,
    events: Arc<dyn EventSink>,
    rule_source: Box<dyn RuleSource>,
    rules: Arc<ArcSwap<RuleSet>>,
    proxy: ProxyServer,
    proxy_handle: Option<ProxyHandle>,
    generation: AtomicU64,
}

impl Core {
    pub fn new(
        config: Config,
        keystore: Arc<dyn KeyStore>,
        events: Arc<dyn EventSink>,
        delegate: ProxyDelegate,
        rule_source: Box<dyn RuleSource>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let ca = Arc::new(CertificateAuthority::load_or_create(
            CaConfig {
                leaf_ttl: Duration::from_secs(u64::from(config.cache_leaf_ttl_secs)),
                leaf_cache_max: config.cache_leaf_max as usize,
                ..CaConfig::default()
            },
            keystore,
        )?);

        let stats = Arc::new(StatsRegistry::default());
        let rules = RuleSet::compile(&rule_source.load(), 1)?;
        stats.set_domains_indexed(rules.total_domains() as u64);

        let proxy = ProxyServer::new(
            ProxyConfig {
                listen_port: config.proxy_port,
                origin_verify_system_trust: config.origin_verify_system_trust,
                bypass_patterns: config.bypass_patterns.clone(),
                ..ProxyConfig::default()
            },
            Arc::clone(&ca),
            Arc::clone(&rules),
            delegate,
            Arc::clone(&events),
            Arc::clone(&stats),
        )?;

        Ok(Self {
            ca,
            stats,
            events,
            rule_source,
            rules: Arc::new(ArcSwap::from(rules)),
            proxy,
            proxy_handle: None,
            generation: AtomicU64::new(1),
        })
    }

    /// Spawns the packet worker pool over the live rule snapshot. The
    /// pipeline sees reloads immediately; per-flow order is preserved by
    /// flow-hash pinning.
    pub fn start_pipeline(
        &self,
        worker_count: usize,
        write_back: crate::pipeline::WriteBack,
    ) -> crate::pipeline::PacketPipeline {
        crate::pipeline::PacketPipeline::start(
            worker_count,
            Arc::clone(&self.rules),
            Arc::clone(&self.stats),
            write_back,
        )
    }

    /// Packet entry for the platform tunnel: one IP datagram in, one
    /// decision out. Never fails; malformed input forwards.
    pub fn classify_packet(&self, packet: &[u8], family: IpFamily) -> Decision {
        let rules = self.rules.load();
        let decision = guard_inspect::classify(packet, family, rules.domain_index());
        if decision == Decision::Drop {
            self.stats.record_blocked(0);
        }
        self.publish_index_stats(&rules);
        decision
    }

    /// Recompiles the rule sources and atomically publishes the snapshot.
    /// In-flight proxy connections keep the snapshot they started with.
    pub fn reload_rules(&self) -> Result<ReloadSummary, CoreError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let rules = RuleSet::compile(&self.rule_source.load(), generation)?;
        let summary = ReloadSummary {
            generation,
            domains_indexed: rules.total_domains(),
            skipped_lines: rules.skipped_lines().len(),
        };

        for skipped in rules.skipped_lines() {
            tracing::warn!(
                source = %skipped.source_id,
                line = skipped.line_number,
                reason = %skipped.reason,
                "rule line skipped"
            );
        }

        self.stats.set_domains_indexed(summary.domains_indexed as u64);
        self.proxy.reload_rules(Arc::clone(&rules));
        self.rules.store(rules);

        self.events.emit(
            Event::new(
                EventType::RulesReloaded,
                FlowContext {
                    flow_id: 0,
                    client_addr: String::new(),
                    server_host: String::new(),
                    server_port: 0,
                    transport: FlowTransport::Http,
                },
            )
            .with_attribute("generation", generation.to_string())
            .with_attribute("domains", summary.domains_indexed.to_string()),
        );

        Ok(summary)
    }

    pub async fn start_proxy(&mut self) -> Result<std::net::SocketAddr, CoreError> {
        if self.proxy_handle.is_some() {
            return Err(CoreError::ProxyAlreadyRunning);
        }
        let handle = self.proxy.start().await?;
        let local_addr = handle.local_addr;
        self.proxy_handle = Some(handle);
        Ok(local_addr)
    }

    pub async fn stop_proxy(&mut self) {
        if let Some(handle) = self.proxy_handle.take() {
            handle.stop().await;
        }
    }

    pub fn proxy_running(&self) -> bool {
        self.proxy_handle.is_some()
    }

    pub fn export_root_pem(&self) -> Result<String, CoreError> {
        Ok(self.ca.export_root_pem()?)
    }

    /// Deletes the persisted root and its leaves; the next TLS
    /// interception mints against a fresh root.
    pub fn regenerate_root(&self) -> Result<(), CoreError> {
        self.ca.delete_root()?;
        Ok(())
    }

    pub fn current_rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    pub fn stats_snapshot(&self) -> guard_observe::StatsSnapshot {
        self.publish_index_stats(&self.rules.load());
        self.stats.snapshot()
    }

    /// Copies the index's interior counters into the registry gauges.
    fn publish_index_stats(&self, rules: &RuleSet) {
        let index_stats = rules.domain_index().stats();
        let snapshot = self.stats.snapshot();
        for _ in snapshot.bloom_rejects..index_stats.bloom_rejects {
            self.stats.record_bloom_reject();
        }
        for _ in snapshot.trie_hits..index_stats.trie_hits {
            self.stats.record_trie_hit();
        }
    }
}

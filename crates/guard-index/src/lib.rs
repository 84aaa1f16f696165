//! Compiled blocklist index: a Bloom prefilter in front of a reverse-label
//! trie. Snapshots are immutable after build and safe to share across any
//! number of reader threads; rule reloads publish a fresh snapshot instead
//! of mutating in place.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

mod bloom;
mod domain;
mod trie;

pub use bloom::BloomFilter;
pub use domain::{
    normalize_domain, normalize_query, DomainParseError, NormalizedDomain, MAX_DOMAIN_OCTETS,
    MAX_LABEL_OCTETS,
};
use trie::{DomainTrie, TrieMatch};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid domain {domain:?}: {reason}")]
    InvalidDomain { domain: String, reason: &'static str },
}

/// One rule domain headed for the index. `tag` identifies the originating
/// rule for attribution in stats and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRule {
    pub domain: String,
    pub tag: Option<String>,
}

impl DomainRule {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tag: None,
        }
    }

    pub fn tagged(domain: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            tag: Some(tag.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainMatch {
    pub blocked: bool,
    pub rule_tag: Option<Arc<str>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub bloom_rejects: u64,
    pub trie_hits: u64,
}

/// Immutable (Bloom, trie) pair. Every domain inserted into the trie is
/// inserted into the Bloom filter, so a Bloom miss on every label suffix of
/// a query proves the trie holds no match for it.
#[derive(Debug)]
pub struct DomainSnapshot {
    bloom: BloomFilter,
    trie: DomainTrie,
    total_domains: usize,
    bloom_rejects: AtomicU64,
    trie_hits: AtomicU64,
}

pub struct DomainSet;

impl DomainSet {
    pub fn build<I>(rules: I) -> Result<Arc<DomainSnapshot>, IndexError>
    where
        I: IntoIterator<Item = DomainRule>,
    {
        let rules: Vec<DomainRule> = rules.into_iter().collect();
        let mut bloom = BloomFilter::with_capacity(rules.len());
        let mut trie = DomainTrie::default();
        let mut total_domains = 0_usize;

        for rule in rules {
            let normalized =
                normalize_domain(&rule.domain).map_err(|error| IndexError::InvalidDomain {
                    domain: rule.domain.clone(),
                    reason: error.reason(),
                })?;
            bloom.insert(normalized.name.as_bytes());
            trie.insert(
                &normalized.name,
                normalized.wildcard,
                rule.tag.map(Arc::from),
            );
            total_domains += 1;
        }

        Ok(Arc::new(DomainSnapshot {
            bloom,
            trie,
            total_domains,
            bloom_rejects: AtomicU64::new(0),
            trie_hits: AtomicU64::new(0),
        }))
    }
}

impl DomainSnapshot {
    /// Total function: malformed queries are non-matches, never errors.
    pub fn lookup(&self, domain: &str) -> DomainMatch {
        let Some(name) = normalize_query(domain) else {
            return DomainMatch::default();
        };

        // Wildcard rules are stored under their base name, so the filter is
        // probed with every label suffix of the query; no suffix present
        // means no exact or wildcard rule can match.
        if !self.bloom_admits_any_suffix(&name) {
            self.bloom_rejects.fetch_add(1, Ordering::Relaxed);
            return DomainMatch::default();
        }

        match self.trie.lookup(&name) {
            TrieMatch::Exact(tag) | TrieMatch::Wildcard(tag) => {
                self.trie_hits.fetch_add(1, Ordering::Relaxed);
                DomainMatch {
                    blocked: true,
                    rule_tag: tag,
                }
            }
            TrieMatch::None => DomainMatch::default(),
        }
    }

    fn bloom_admits_any_suffix(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        let mut start = 0_usize;
        loop {
            if self.bloom.contains(&bytes[start..]) {
                return true;
            }
            match bytes[start..].iter().position(|&byte| byte == b'.') {
                Some(dot) => start += dot + 1,
                None => return false,
            }
        }
    }

    pub fn total_domains(&self) -> usize {
        self.total_domains
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            bloom_rejects: self.bloom_rejects.load(Ordering::Relaxed),
            trie_hits: self.trie_hits.load(Ordering::Relaxed),
        }
    }
}

//! Root persistence and on-demand leaf issuance with the TTL/LRU cache.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::keys::{random_serial, KeyKind, PrivateKeyMaterial};
use crate::keystore::KeyStore;
use crate::x509::{
    build_tbs_certificate, distinguished_name, leaf_extensions, parse_certificate,
    root_extensions, sign_certificate, TbsParams,
};
use crate::{pem, CaError};

pub const ROOT_CERT_LABEL: &str = "shadowguard.root.cert";
pub const ROOT_KEY_LABEL: &str = "shadowguard.root.key";

const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const LEAF_BACKDATE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub key_kind: KeyKind,
    pub root_common_name: String,
    pub organization: String,
    pub country: String,
    pub leaf_ttl: Duration,
    pub leaf_cache_max: usize,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            key_kind: KeyKind::EcdsaP256,
            root_common_name: "ShadowGuard Root CA".to_string(),
            organization: "ShadowGuard".to_string(),
            country: "US".to_string(),
            leaf_ttl: Duration::from_secs(24 * 60 * 60),
            leaf_cache_max: 1000,
        }
    }
}

/// A minted leaf plus everything the TLS stack needs to serve it.
pub struct LeafEntry {
    pub domain: String,
    pub cert_der: Vec<u8>,
    pub key_pkcs8_der: Zeroizing<Vec<u8>>,
    /// Leaf first, root second.
    pub chain_der: Vec<Vec<u8>>,
    pub issued_at: SystemTime,
}

#[derive(Clone)]
struct RootMaterial {
    key: PrivateKeyMaterial,
    cert_der: Vec<u8>,
    subject_name_der: Vec<u8>,
}

struct CaState {
    root: Option<RootMaterial>,
    leaf_cache: HashMap<String, Arc<LeafEntry>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeafCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub issued: u64,
    pub size: u64,
}

pub struct CertificateAuthority {
    config: CaConfig,
    keystore: Arc<dyn KeyStore>,
    state: Mutex<CaState>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
}

impl CertificateAuthority {
    /// Idempotent: returns the persisted root when the keystore has one,
    /// otherwise generates and persists a fresh root.
    pub fn load_or_create(
        config: CaConfig,
        keystore: Arc<dyn KeyStore>,
    ) -> Result<Self, CaError> {
        let authority = Self {
            config,
            keystore,
            state: Mutex::new(CaState {
                root: None,
                leaf_cache: HashMap::new(),
            }),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
        };
        {
            let mut state = authority.lock_state()?;
            authority.ensure_root(&mut state)?;
        }
        Ok(authority)
    }

    pub fn root_cert_der(&self) -> Result<Vec<u8>, CaError> {
        let mut state = self.lock_state()?;
        let root = self.ensure_root(&mut state)?;
        Ok(root.cert_der)
    }

    pub fn export_root_pem(&self) -> Result<String, CaError> {
        Ok(pem::encode_certificate(&self.root_cert_der()?))
    }

    /// Removes the persisted root and flushes every cached leaf. The next
    /// mint or export regenerates a fresh root.
    pub fn delete_root(&self) -> Result<(), CaError> {
        self.keystore.delete(ROOT_CERT_LABEL)?;
        self.keystore.delete(ROOT_KEY_LABEL)?;
        let mut state = self.lock_state()?;
        state.root = None;
        state.leaf_cache.clear();
        Ok(())
    }

    /// Cache-first leaf lookup. Key generation and signing run outside the
    /// state lock and are retried once before the error propagates.
    pub fn mint_leaf(&self, domain: &str) -> Result<Arc<LeafEntry>, CaError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return Err(CaError::InvalidMaterial("empty leaf domain".to_string()));
        }

        let root = {
            let mut state = self.lock_state()?;
            if let Some(entry) = state.leaf_cache.get(&domain) {
                if entry_is_fresh(entry, self.config.leaf_ttl) {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(entry));
                }
            }
            self.ensure_root(&mut state)?
        };
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let entry = match self.issue_leaf(&root, &domain) {
            Ok(entry) => entry,
            Err(_) => self.issue_leaf(&root, &domain)?,
        };
        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(entry);

        let mut state = self.lock_state()?;
        if state.leaf_cache.len() >= self.config.leaf_cache_max {
            evict_oldest_quartile(&mut state.leaf_cache);
        }
        state.leaf_cache.insert(domain, Arc::clone(&entry));
        Ok(entry)
    }

    pub fn cache_metrics(&self) -> LeafCacheMetrics {
        let size = self
            .state
            .lock()
            .map(|state| state.leaf_cache.len() as u64)
            .unwrap_or(0);
        LeafCacheMetrics {
            hits: self.cache_hits.load(Ordering::Relaxed),
            misses: self.cache_misses.load(Ordering::Relaxed),
            issued: self.leaves_issued.load(Ordering::Relaxed),
            size,
        }
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, CaState>, CaError> {
        self.state
            .lock()
            .map_err(|_| CaError::KeystoreUnavailable("authority lock poisoned".to_string()))
    }

    fn ensure_root(&self, state: &mut CaState) -> Result<RootMaterial, CaError> {
        if let Some(root) = &state.root {
            return Ok(root.clone());
        }

        let cert = self.keystore.get(ROOT_CERT_LABEL)?;
        let key = self.keystore.get(ROOT_KEY_LABEL)?;
        let root = match (cert, key) {
            (Some(cert_der), Some(key_der)) => {
                let key_der = Zeroizing::new(key_der);
                load_root(cert_der, &key_der)?
            }
            (None, None) => {
                let root = self.generate_root()?;
                self.persist_root(&root)?;
                root
            }
            _ => {
                return Err(CaError::InvalidMaterial(
                    "keystore holds root cert or key but not both".to_string(),
                ))
            }
        };

        state.root = Some(root.clone());
        Ok(root)
    }

    fn generate_root(&self) -> Result<RootMaterial, CaError> {
        let key = match PrivateKeyMaterial::generate_root(self.config.key_kind) {
            Ok(key) => key,
            Err(_) => PrivateKeyMaterial::generate_root(self.config.key_kind)?,
        };
        let subject_name_der = distinguished_name(
            &self.config.root_common_name,
            &self.config.organization,
            &self.config.country,
        );

        let now: DateTime<Utc> = Utc::now();
        let tbs = build_tbs_certificate(&TbsParams {
            serial: &random_serial(),
            signature_algorithm_der: &key.signature_algorithm_der(),
            issuer_name_der: &subject_name_der,
            not_before: now,
            not_after: now + chrono::Duration::days(ROOT_VALIDITY_DAYS),
            subject_name_der: &subject_name_der,
            spki_der: &key.spki_der()?,
            extensions: &root_extensions(),
        });
        let cert_der = sign_certificate(&tbs, &key)?;

        Ok(RootMaterial {
            key,
            cert_der,
            subject_name_der,
        })
    }

    fn persist_root(&self, root: &RootMaterial) -> Result<(), CaError> {
        self.keystore.put(ROOT_CERT_LABEL, &root.cert_der)?;
        let key_der = root.key.pkcs8_der()?;
        self.keystore.put(ROOT_KEY_LABEL, &key_der)
    }

    fn issue_leaf(&self, root: &RootMaterial, domain: &str) -> Result<LeafEntry, CaError> {
        let leaf_key = PrivateKeyMaterial::generate_leaf(self.config.key_kind)?;
        let subject_name_der =
            distinguished_name(domain, &self.config.organization, &self.config.country);

        let issued_at = SystemTime::now();
        let not_before: DateTime<Utc> = DateTime::<Utc>::from(issued_at - LEAF_BACKDATE);
        let tbs = build_tbs_certificate(&TbsParams {
            serial: &random_serial(),
            // The TBS names the algorithm of the *root* signature to come.
            signature_algorithm_der: &root.key.signature_algorithm_der(),
            issuer_name_der: &root.subject_name_der,
            not_before,
            not_after: not_before + chrono::Duration::days(LEAF_VALIDITY_DAYS),
            subject_name_der: &subject_name_der,
            spki_der: &leaf_key.spki_der()?,
            extensions: &leaf_extensions(domain),
        });
        let cert_der = sign_certificate(&tbs, &root.key)?;

        Ok(LeafEntry {
            domain: domain.to_string(),
            chain_der: vec![cert_der.clone(), root.cert_der.clone()],
            cert_der,
            key_pkcs8_der: leaf_key.pkcs8_der()?,
            issued_at,
        })
    }
}

fn load_root(cert_der: Vec<u8>, key_der: &[u8]) -> Result<RootMaterial, CaError> {
    let parts = parse_certificate(&cert_der)?;
    let key = PrivateKeyMaterial::from_pkcs8_der(key_der)?;
    if key.spki_der()? != parts.spki_der {
        return Err(CaError::InvalidMaterial(
            "persisted root key does not match root certificate".to_string(),
        ));
    }
    Ok(RootMaterial {
        key,
        cert_der,
        subject_name_der: parts.subject_name_der,
    })
}

fn entry_is_fresh(entry: &LeafEntry, ttl: Duration) -> bool {
    entry
        .issued_at
        .elapsed()
        .map(|age| age < ttl)
        .unwrap_or(false)
}

/// At capacity, the oldest quarter of the cache (by issue time) goes.
fn evict_oldest_quartile(cache: &mut HashMap<String, Arc<LeafEntry>>) {
    let mut by_age: Vec<(String, SystemTime)> = cache
        .iter()
        .map(|(domain, entry)| (domain.clone(), entry.issued_at))
        .collect();
    by_age.sort_by_key(|(_, issued_at)| *issued_at);

    let evict_count = (cache.len() / 4).max(1);
    for (domain, _) in by_age.into_iter().take(evict_count) {
        cache.remove(&domain);
    }
}

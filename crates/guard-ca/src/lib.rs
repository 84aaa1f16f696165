//! On-device certificate authority: a persistent self-signed root and
//! short-lived per-host leaves, encoded by a hand-written DER builder so the
//! whole trust path is testable in isolation.

use thiserror::Error;

pub mod der;
mod authority;
mod keys;
mod keystore;
mod pem;
mod x509;

pub use authority::{
    CaConfig, CertificateAuthority, LeafCacheMetrics, LeafEntry, ROOT_CERT_LABEL, ROOT_KEY_LABEL,
};
pub use keys::{random_serial, KeyKind, PrivateKeyMaterial};
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use pem::encode_certificate as encode_certificate_pem;
pub use x509::{parse_certificate, CertificateParts};

#[derive(Debug, Error)]
pub enum CaError {
    #[error("keystore unavailable: {0}")]
    KeystoreUnavailable(String),
    #[error("key generation failed: {0}")]
    KeygenFailed(String),
    #[error("signing failed: {0}")]
    SignFailed(String),
    #[error("DER encoding failed: {0}")]
    EncodeFailed(String),
    #[error("invalid certificate material: {0}")]
    InvalidMaterial(String),
}

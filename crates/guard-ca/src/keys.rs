//! Key material behind the root and leaves. Two families are supported:
//! ECDSA P-256 (default, cheap on-device) and RSA (4096-bit roots,
//! 2048-bit leaves). Serialized private keys travel in zeroizing buffers.

use p256::ecdsa::signature::Signer;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::der;
use crate::CaError;

/// OID arcs for the two signature algorithms the CA emits.
const OID_SHA256_WITH_RSA: [u64; 7] = [1, 2, 840, 113549, 1, 1, 11];
const OID_ECDSA_WITH_SHA256: [u64; 7] = [1, 2, 840, 10045, 4, 3, 2];

const RSA_ROOT_BITS: usize = 4096;
const RSA_LEAF_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyKind {
    #[default]
    EcdsaP256,
    Rsa,
}

#[derive(Clone)]
pub enum PrivateKeyMaterial {
    EcdsaP256(p256::ecdsa::SigningKey),
    Rsa(Box<rsa::RsaPrivateKey>),
}

impl PrivateKeyMaterial {
    pub fn generate_root(kind: KeyKind) -> Result<Self, CaError> {
        Self::generate(kind, RSA_ROOT_BITS)
    }

    pub fn generate_leaf(kind: KeyKind) -> Result<Self, CaError> {
        Self::generate(kind, RSA_LEAF_BITS)
    }

    fn generate(kind: KeyKind, rsa_bits: usize) -> Result<Self, CaError> {
        match kind {
            KeyKind::EcdsaP256 => Ok(Self::EcdsaP256(p256::ecdsa::SigningKey::random(&mut OsRng))),
            KeyKind::Rsa => {
                let key = rsa::RsaPrivateKey::new(&mut OsRng, rsa_bits)
                    .map_err(|error| CaError::KeygenFailed(error.to_string()))?;
                Ok(Self::Rsa(Box::new(key)))
            }
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::EcdsaP256(_) => KeyKind::EcdsaP256,
            Self::Rsa(_) => KeyKind::Rsa,
        }
    }

    /// SubjectPublicKeyInfo, already DER.
    pub fn spki_der(&self) -> Result<Vec<u8>, CaError> {
        let document = match self {
            Self::EcdsaP256(key) => p256::PublicKey::from(key.verifying_key())
                .to_public_key_der()
                .map_err(|error| CaError::EncodeFailed(error.to_string()))?,
            Self::Rsa(key) => key
                .to_public_key()
                .to_public_key_der()
                .map_err(|error| CaError::EncodeFailed(error.to_string()))?,
        };
        Ok(document.into_vec())
    }

    /// PKCS#8 form for persistence and for handing leaves to the TLS stack.
    pub fn pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>, CaError> {
        let document = match self {
            Self::EcdsaP256(key) => key
                .to_pkcs8_der()
                .map_err(|error| CaError::EncodeFailed(error.to_string()))?,
            Self::Rsa(key) => key
                .to_pkcs8_der()
                .map_err(|error| CaError::EncodeFailed(error.to_string()))?,
        };
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }

    pub fn from_pkcs8_der(bytes: &[u8]) -> Result<Self, CaError> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(bytes) {
            return Ok(Self::EcdsaP256(key));
        }
        rsa::RsaPrivateKey::from_pkcs8_der(bytes)
            .map(|key| Self::Rsa(Box::new(key)))
            .map_err(|error| CaError::InvalidMaterial(format!("unreadable private key: {error}")))
    }

    /// AlgorithmIdentifier for certificates signed with this key.
    pub fn signature_algorithm_der(&self) -> Vec<u8> {
        match self {
            // ecdsa-with-SHA256 takes no parameters.
            Self::EcdsaP256(_) => der::sequence(&[&der::oid(&OID_ECDSA_WITH_SHA256)]),
            Self::Rsa(_) => der::sequence(&[&der::oid(&OID_SHA256_WITH_RSA), &der::null()]),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CaError> {
        match self {
            Self::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key.sign(message);
                Ok(signature.to_der().as_bytes().to_vec())
            }
            Self::Rsa(key) => {
                let digest = Sha256::digest(message);
                key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
                    .map_err(|error| CaError::SignFailed(error.to_string()))
            }
        }
    }
}

/// 16 random bytes with the high bit cleared, so the DER INTEGER stays
/// positive without a sign pad. A zero first byte would shrink the minimal
/// encoding below 16 bytes, so it is bumped.
pub fn random_serial() -> [u8; 16] {
    use rand::RngCore;

    let mut serial = [0_u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    if serial[0] == 0 {
        serial[0] = 0x01;
    }
    serial
}

//! X.509 v3 assembly on top of the DER builder, plus a small reader used to
//! recover the subject name and TBS bytes from persisted certificates.

use chrono::{DateTime, Datelike, Utc};

use crate::der::{self, Tlv};
use crate::keys::PrivateKeyMaterial;
use crate::CaError;

const OID_COMMON_NAME: [u64; 4] = [2, 5, 4, 3];
const OID_ORGANIZATION: [u64; 4] = [2, 5, 4, 10];
const OID_COUNTRY: [u64; 4] = [2, 5, 4, 6];

const OID_BASIC_CONSTRAINTS: [u64; 4] = [2, 5, 29, 19];
const OID_KEY_USAGE: [u64; 4] = [2, 5, 29, 15];
const OID_EXT_KEY_USAGE: [u64; 4] = [2, 5, 29, 37];
const OID_SUBJECT_ALT_NAME: [u64; 4] = [2, 5, 29, 17];
const OID_EKU_SERVER_AUTH: [u64; 9] = [1, 3, 6, 1, 5, 5, 7, 3, 1];

// KeyUsage named bits, MSB first.
const KEY_USAGE_LEAF_BITS: u8 = 0b1010_0000; // digitalSignature, keyEncipherment
const KEY_USAGE_LEAF_UNUSED: u8 = 5;
const KEY_USAGE_CA_BITS: u8 = 0b1000_0110; // digitalSignature, keyCertSign, cRLSign
const KEY_USAGE_CA_UNUSED: u8 = 1;

/// Distinguished name rendered as `C`, `O`, `CN` RDNs in that order. The
/// country is a PrintableString, the rest UTF8Strings.
pub fn distinguished_name(common_name: &str, organization: &str, country: &str) -> Vec<u8> {
    let country_rdn = der::set(&[&der::sequence(&[
        &der::oid(&OID_COUNTRY),
        &der::printable_string(country),
    ])]);
    let organization_rdn = der::set(&[&der::sequence(&[
        &der::oid(&OID_ORGANIZATION),
        &der::utf8_string(organization),
    ])]);
    let common_name_rdn = der::set(&[&der::sequence(&[
        &der::oid(&OID_COMMON_NAME),
        &der::utf8_string(common_name),
    ])]);
    der::sequence(&[&country_rdn, &organization_rdn, &common_name_rdn])
}

/// Validity timestamps use UTCTime until 2050, GeneralizedTime after, as
/// DER requires.
fn time_der(at: DateTime<Utc>) -> Vec<u8> {
    if at.year() < 2050 {
        der::utc_time(&at.format("%y%m%d%H%M%SZ").to_string())
    } else {
        der::generalized_time(&at.format("%Y%m%d%H%M%SZ").to_string())
    }
}

fn extension(oid_arcs: &[u64], critical: bool, inner_der: &[u8]) -> Vec<u8> {
    let wrapped = der::octet_string(inner_der);
    if critical {
        der::sequence(&[&der::oid(oid_arcs), &der::boolean(true), &wrapped])
    } else {
        der::sequence(&[&der::oid(oid_arcs), &wrapped])
    }
}

pub struct TbsParams<'a> {
    pub serial: &'a [u8],
    pub signature_algorithm_der: &'a [u8],
    pub issuer_name_der: &'a [u8],
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub subject_name_der: &'a [u8],
    pub spki_der: &'a [u8],
    pub extensions: &'a [Vec<u8>],
}

pub fn build_tbs_certificate(params: &TbsParams<'_>) -> Vec<u8> {
    let version = der::context_explicit(0, &der::integer_u64(2));
    let serial = der::integer_unsigned(params.serial);
    let validity = der::sequence(&[
        &time_der(params.not_before),
        &time_der(params.not_after),
    ]);

    let extension_refs: Vec<&[u8]> = params
        .extensions
        .iter()
        .map(|extension| extension.as_slice())
        .collect();
    let extensions = der::context_explicit(3, &der::sequence(&extension_refs));

    der::sequence(&[
        &version,
        &serial,
        params.signature_algorithm_der,
        params.issuer_name_der,
        &validity,
        params.subject_name_der,
        params.spki_der,
        &extensions,
    ])
}

pub fn leaf_extensions(domain: &str) -> Vec<Vec<u8>> {
    // CA=FALSE is the BasicConstraints default, so the sequence is empty.
    let basic_constraints = extension(&OID_BASIC_CONSTRAINTS, true, &der::sequence(&[]));
    let key_usage = extension(
        &OID_KEY_USAGE,
        true,
        &der::bit_string(&[KEY_USAGE_LEAF_BITS], KEY_USAGE_LEAF_UNUSED),
    );
    let extended_key_usage = extension(
        &OID_EXT_KEY_USAGE,
        false,
        &der::sequence(&[&der::oid(&OID_EKU_SERVER_AUTH)]),
    );
    let alt_names = der::sequence(&[
        &der::context_implicit_primitive(2, domain.as_bytes()),
        &der::context_implicit_primitive(2, format!("*.{domain}").as_bytes()),
    ]);
    let subject_alt_name = extension(&OID_SUBJECT_ALT_NAME, false, &alt_names);

    vec![
        basic_constraints,
        key_usage,
        extended_key_usage,
        subject_alt_name,
    ]
}

pub fn root_extensions() -> Vec<Vec<u8>> {
    let basic_constraints = extension(
        &OID_BASIC_CONSTRAINTS,
        true,
        &der::sequence(&[&der::boolean(true)]),
    );
    let key_usage = extension(
        &OID_KEY_USAGE,
        true,
        &der::bit_string(&[KEY_USAGE_CA_BITS], KEY_USAGE_CA_UNUSED),
    );
    vec![basic_constraints, key_usage]
}

/// Signs `tbs_der` with `signer` and wraps the three-field Certificate.
pub fn sign_certificate(
    tbs_der: &[u8],
    signer: &PrivateKeyMaterial,
) -> Result<Vec<u8>, CaError> {
    let signature = signer.sign(tbs_der)?;
    Ok(der::sequence(&[
        tbs_der,
        &signer.signature_algorithm_der(),
        &der::bit_string(&signature, 0),
    ]))
}

/// The TBS fields the rest of the system needs back out of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateParts {
    pub tbs_der: Vec<u8>,
    pub serial: Vec<u8>,
    pub issuer_name_der: Vec<u8>,
    pub subject_name_der: Vec<u8>,
    pub spki_der: Vec<u8>,
    pub signature: Vec<u8>,
}

pub fn parse_certificate(cert_der: &[u8]) -> Result<CertificateParts, CaError> {
    let bad = |detail: &str| CaError::InvalidMaterial(format!("malformed certificate: {detail}"));

    let (certificate, rest) = der::read_tlv(cert_der).map_err(|error| bad(&error.to_string()))?;
    if !rest.is_empty() || certificate.tag != der::TAG_SEQUENCE {
        return Err(bad("trailing bytes or wrong outer tag"));
    }

    let outer = der::read_children(certificate.content)
        .map_err(|error| bad(&error.to_string()))?;
    let [tbs, _algorithm, signature_bits]: [Tlv<'_>; 3] = outer
        .try_into()
        .map_err(|_| bad("expected three top-level fields"))?;

    let tbs_fields =
        der::read_children(tbs.content).map_err(|error| bad(&error.to_string()))?;
    // [0] version, serial, algorithm, issuer, validity, subject, spki, [3].
    if tbs_fields.len() < 7 {
        return Err(bad("short TBSCertificate"));
    }
    let has_version = tbs_fields[0].tag == 0xa0;
    let base = if has_version { 1 } else { 0 };
    let serial = tbs_fields[base];
    let issuer = tbs_fields[base + 2];
    let subject = tbs_fields[base + 4];
    let spki = tbs_fields[base + 5];
    if serial.tag != der::TAG_INTEGER {
        return Err(bad("serial is not an INTEGER"));
    }

    if signature_bits.tag != der::TAG_BIT_STRING || signature_bits.content.is_empty() {
        return Err(bad("signature is not a BIT STRING"));
    }

    Ok(CertificateParts {
        tbs_der: tbs.raw.to_vec(),
        serial: serial.content.to_vec(),
        issuer_name_der: issuer.raw.to_vec(),
        subject_name_der: subject.raw.to_vec(),
        spki_der: spki.raw.to_vec(),
        signature: signature_bits.content[1..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        build_tbs_certificate, distinguished_name, leaf_extensions, parse_certificate,
        root_extensions, sign_certificate, TbsParams,
    };
    use crate::keys::{random_serial, KeyKind, PrivateKeyMaterial};

    #[test]
    fn distinguished_name_field_order_is_stable() {
        let first = distinguished_name("ShadowGuard Root CA", "ShadowGuard", "US");
        let second = distinguished_name("ShadowGuard Root CA", "ShadowGuard", "US");
        assert_eq!(first, second);
        // C= comes first and is a PrintableString.
        assert!(first
            .windows(4)
            .any(|window| window == [0x13, 0x02, b'U', b'S']));
    }

    #[test]
    fn certificate_parses_back_to_its_inputs() {
        let key = PrivateKeyMaterial::generate_root(KeyKind::EcdsaP256).expect("keygen");
        let name = distinguished_name("ShadowGuard Root CA", "ShadowGuard", "US");
        let serial = random_serial();
        let spki = key.spki_der().expect("spki");

        let tbs = build_tbs_certificate(&TbsParams {
            serial: &serial,
            signature_algorithm_der: &key.signature_algorithm_der(),
            issuer_name_der: &name,
            not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2036, 1, 1, 0, 0, 0).unwrap(),
            subject_name_der: &name,
            spki_der: &spki,
            extensions: &root_extensions(),
        });
        let cert = sign_certificate(&tbs, &key).expect("sign");

        let parts = parse_certificate(&cert).expect("parse");
        assert_eq!(parts.subject_name_der, name);
        assert_eq!(parts.issuer_name_der, name);
        assert_eq!(parts.spki_der, spki);
        // random_serial clears the high bit, so no sign pad is added.
        assert_eq!(parts.serial, serial.to_vec());
        assert_eq!(parts.tbs_der, tbs);
    }

    #[test]
    fn leaf_extensions_carry_both_san_entries() {
        let extensions = leaf_extensions("example.com");
        let rendered: Vec<u8> = extensions.concat();
        let needle = b"example.com";
        let wildcard = b"*.example.com";
        assert!(rendered
            .windows(needle.len())
            .any(|window| window == needle));
        assert!(rendered
            .windows(wildcard.len())
            .any(|window| window == wildcard));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_certificate(&[]).is_err());
        assert!(parse_certificate(&[0x30, 0x03, 0x02, 0x01, 0x01]).is_err());
    }
}

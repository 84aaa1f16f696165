//! Minimal DER writer/reader for the certificate paths.
//!
//! Integers use the smallest two's-complement form; lengths use the short
//! form below 128 and the definite long form above it.

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_BIT_STRING: u8 = 0x03;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_NULL: u8 = 0x05;
pub const TAG_OID: u8 = 0x06;
pub const TAG_UTF8_STRING: u8 = 0x0c;
pub const TAG_PRINTABLE_STRING: u8 = 0x13;
pub const TAG_IA5_STRING: u8 = 0x16;
pub const TAG_UTC_TIME: u8 = 0x17;
pub const TAG_GENERALIZED_TIME: u8 = 0x18;
pub const TAG_SEQUENCE: u8 = 0x30;
pub const TAG_SET: u8 = 0x31;

pub fn encode_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 6);
    out.push(tag);
    push_length(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

fn push_length(out: &mut Vec<u8>, length: usize) {
    if length < 0x80 {
        out.push(length as u8);
        return;
    }
    let bytes = length.to_be_bytes();
    let skip = bytes.iter().take_while(|&&byte| byte == 0).count();
    let significant = &bytes[skip..];
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(significant);
}

pub fn sequence(children: &[&[u8]]) -> Vec<u8> {
    let mut content = Vec::new();
    for child in children {
        content.extend_from_slice(child);
    }
    encode_tlv(TAG_SEQUENCE, &content)
}

pub fn set(children: &[&[u8]]) -> Vec<u8> {
    let mut content = Vec::new();
    for child in children {
        content.extend_from_slice(child);
    }
    encode_tlv(TAG_SET, &content)
}

pub fn boolean(value: bool) -> Vec<u8> {
    encode_tlv(TAG_BOOLEAN, &[if value { 0xff } else { 0x00 }])
}

/// Non-negative INTEGER from big-endian magnitude bytes.
pub fn integer_unsigned(magnitude: &[u8]) -> Vec<u8> {
    let skip = magnitude.iter().take_while(|&&byte| byte == 0).count();
    let stripped = &magnitude[skip..];
    if stripped.is_empty() {
        return encode_tlv(TAG_INTEGER, &[0x00]);
    }
    if stripped[0] & 0x80 != 0 {
        let mut content = Vec::with_capacity(stripped.len() + 1);
        content.push(0x00);
        content.extend_from_slice(stripped);
        return encode_tlv(TAG_INTEGER, &content);
    }
    encode_tlv(TAG_INTEGER, stripped)
}

pub fn integer_u64(value: u64) -> Vec<u8> {
    integer_unsigned(&value.to_be_bytes())
}

pub fn bit_string(bits: &[u8], unused_bits: u8) -> Vec<u8> {
    let mut content = Vec::with_capacity(bits.len() + 1);
    content.push(unused_bits);
    content.extend_from_slice(bits);
    encode_tlv(TAG_BIT_STRING, &content)
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    encode_tlv(TAG_OCTET_STRING, bytes)
}

pub fn null() -> Vec<u8> {
    encode_tlv(TAG_NULL, &[])
}

pub fn oid(arcs: &[u64]) -> Vec<u8> {
    debug_assert!(arcs.len() >= 2, "an OID needs at least two arcs");
    let mut content = Vec::new();
    push_base128(&mut content, arcs[0] * 40 + arcs[1]);
    for &arc in &arcs[2..] {
        push_base128(&mut content, arc);
    }
    encode_tlv(TAG_OID, &content)
}

fn push_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut chunk = [0_u8; 10];
    let mut index = chunk.len();
    loop {
        index -= 1;
        chunk[index] = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    let last = chunk.len() - 1;
    for (position, &byte) in chunk[index..].iter().enumerate() {
        if index + position == last {
            out.push(byte);
        } else {
            out.push(byte | 0x80);
        }
    }
}

pub fn utf8_string(text: &str) -> Vec<u8> {
    encode_tlv(TAG_UTF8_STRING, text.as_bytes())
}

pub fn printable_string(text: &str) -> Vec<u8> {
    encode_tlv(TAG_PRINTABLE_STRING, text.as_bytes())
}

pub fn ia5_string(text: &str) -> Vec<u8> {
    encode_tlv(TAG_IA5_STRING, text.as_bytes())
}

pub fn utc_time(rendered: &str) -> Vec<u8> {
    encode_tlv(TAG_UTC_TIME, rendered.as_bytes())
}

pub fn generalized_time(rendered: &str) -> Vec<u8> {
    encode_tlv(TAG_GENERALIZED_TIME, rendered.as_bytes())
}

/// `[tag] EXPLICIT`: constructed context tag wrapping complete TLVs.
pub fn context_explicit(tag_number: u8, inner: &[u8]) -> Vec<u8> {
    encode_tlv(0xa0 | tag_number, inner)
}

/// `[tag] IMPLICIT` over a primitive type: bare content bytes.
pub fn context_implicit_primitive(tag_number: u8, content: &[u8]) -> Vec<u8> {
    encode_tlv(0x80 | tag_number, content)
}

/// One parsed TLV plus the unconsumed remainder of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: u8,
    pub content: &'a [u8],
    /// The whole element including tag and length, for byte-identical reuse.
    pub raw: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DerReadError {
    #[error("truncated DER element")]
    Truncated,
    #[error("unsupported or overlong DER length")]
    BadLength,
}

pub fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8]), DerReadError> {
    if input.len() < 2 {
        return Err(DerReadError::Truncated);
    }
    let tag = input[0];
    let first = input[1];
    let (length, header_len) = if first < 0x80 {
        (first as usize, 2)
    } else {
        let count = (first & 0x7f) as usize;
        if count == 0 || count > 8 || input.len() < 2 + count {
            return Err(DerReadError::BadLength);
        }
        let mut length = 0_usize;
        for &byte in &input[2..2 + count] {
            length = length
                .checked_mul(256)
                .ok_or(DerReadError::BadLength)?
                .checked_add(byte as usize)
                .ok_or(DerReadError::BadLength)?;
        }
        (length, 2 + count)
    };

    let total = header_len
        .checked_add(length)
        .ok_or(DerReadError::BadLength)?;
    if input.len() < total {
        return Err(DerReadError::Truncated);
    }

    Ok((
        Tlv {
            tag,
            content: &input[header_len..total],
            raw: &input[..total],
        },
        &input[total..],
    ))
}

/// Splits a constructed element's content into its child TLVs.
pub fn read_children(content: &[u8]) -> Result<Vec<Tlv<'_>>, DerReadError> {
    let mut children = Vec::new();
    let mut rest = content;
    while !rest.is_empty() {
        let (child, remainder) = read_tlv(rest)?;
        children.push(child);
        rest = remainder;
    }
    Ok(children)
}

#[cfg(test)]
mod tests {
    use super::{
        bit_string, boolean, context_explicit, integer_u64, integer_unsigned, oid, read_children,
        read_tlv, sequence, utf8_string, TAG_SEQUENCE,
    };

    #[test]
    fn short_and_long_form_lengths() {
        let short = super::octet_string(&[0xaa; 127]);
        assert_eq!(short[1], 127);

        let long = super::octet_string(&[0xaa; 128]);
        assert_eq!(long[1], 0x81);
        assert_eq!(long[2], 128);

        let longer = super::octet_string(&[0xaa; 300]);
        assert_eq!(longer[1], 0x82);
        assert_eq!(&longer[2..4], &[0x01, 0x2c]);
    }

    #[test]
    fn integers_use_minimal_twos_complement() {
        assert_eq!(integer_u64(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer_u64(127), vec![0x02, 0x01, 0x7f]);
        // 128 needs a sign pad.
        assert_eq!(integer_u64(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer_u64(256), vec![0x02, 0x02, 0x01, 0x00]);
        // Leading zeros in the magnitude are stripped.
        assert_eq!(integer_unsigned(&[0x00, 0x00, 0x05]), vec![0x02, 0x01, 0x05]);
        assert_eq!(
            integer_unsigned(&[0x00, 0x8f]),
            vec![0x02, 0x02, 0x00, 0x8f]
        );
    }

    #[test]
    fn known_oid_encodings() {
        // id-at-commonName
        assert_eq!(oid(&[2, 5, 4, 3]), vec![0x06, 0x03, 0x55, 0x04, 0x03]);
        // sha256WithRSAEncryption
        assert_eq!(
            oid(&[1, 2, 840, 113549, 1, 1, 11]),
            vec![0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]
        );
        // id-ecPublicKey arc with a large sub-arc
        assert_eq!(
            oid(&[1, 2, 840, 10045, 4, 3, 2]),
            vec![0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02]
        );
    }

    #[test]
    fn bit_string_carries_unused_bit_count() {
        let encoded = bit_string(&[0xa0], 5);
        assert_eq!(encoded, vec![0x03, 0x02, 0x05, 0xa0]);
    }

    #[test]
    fn booleans_are_all_ones_or_all_zeros() {
        assert_eq!(boolean(true), vec![0x01, 0x01, 0xff]);
        assert_eq!(boolean(false), vec![0x01, 0x01, 0x00]);
    }

    #[test]
    fn reader_round_trips_writer_output() {
        let inner = sequence(&[&integer_u64(7), &utf8_string("shadowguard")]);
        let outer = sequence(&[&inner, &context_explicit(3, &boolean(true))]);

        let (tlv, rest) = read_tlv(&outer).expect("read outer");
        assert_eq!(tlv.tag, TAG_SEQUENCE);
        assert!(rest.is_empty());

        let children = read_children(tlv.content).expect("children");
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].raw, inner.as_slice());
        assert_eq!(children[1].tag, 0xa3);
    }

    #[test]
    fn reader_rejects_truncated_input() {
        let valid = utf8_string("example");
        assert!(read_tlv(&valid[..valid.len() - 1]).is_err());
        assert!(read_tlv(&[0x30]).is_err());
    }
}

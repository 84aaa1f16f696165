//! DNS question decoding for the UDP/53 fast path.

use crate::wire::Reader;

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// Decodes the first question name of a DNS *query*. Responses, packets
/// with no question, and names using compression pointers (which a
/// legitimate question section never needs) all yield `None`.
pub(crate) fn query_name(payload: &[u8]) -> Option<String> {
    let mut reader = Reader::new(payload);
    let header = reader.take(HEADER_LEN)?;

    // QR must be 0 (query) and at least one question present.
    if header[2] & 0x80 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([header[4], header[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut name = String::new();
    loop {
        let length = reader.read_u8()?;
        if length == 0 {
            break;
        }
        // Compression pointers (0b11......) are rejected outright.
        if length & 0xc0 != 0 {
            return None;
        }
        let length = usize::from(length);
        if length > MAX_LABEL_LEN {
            return None;
        }
        let label = reader.take(length)?;
        if !name.is_empty() {
            name.push('.');
        }
        if name.len() + label.len() > MAX_NAME_LEN {
            return None;
        }
        for &byte in label {
            if !byte.is_ascii() || byte == b'.' {
                return None;
            }
            name.push(byte.to_ascii_lowercase() as char);
        }
    }

    if name.is_empty() {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::query_name;
    use crate::testutil::dns_query_payload as build_query;

    #[test]
    fn decodes_standard_query() {
        let payload = build_query("DoubleClick.Net", 0x0100);
        assert_eq!(query_name(&payload).as_deref(), Some("doubleclick.net"));
    }

    #[test]
    fn rejects_responses_and_empty_questions() {
        let response = build_query("example.com", 0x8180);
        assert_eq!(query_name(&response), None);

        let mut no_question = build_query("example.com", 0x0100);
        no_question[4] = 0;
        no_question[5] = 0;
        assert_eq!(query_name(&no_question), None);
    }

    #[test]
    fn rejects_compression_pointers_in_question() {
        let mut payload = build_query("example.com", 0x0100);
        // Overwrite the first label length with a pointer marker.
        payload[12] = 0xc0;
        assert_eq!(query_name(&payload), None);
    }

    #[test]
    fn rejects_truncated_names() {
        let payload = build_query("example.com", 0x0100);
        assert_eq!(query_name(&payload[..14]), None);
        assert_eq!(query_name(&[]), None);
    }

    #[test]
    fn rejects_oversized_labels() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0, 1, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        payload.push(64); // label length above the DNS limit
        payload.extend_from_slice(&[b'a'; 64]);
        payload.push(0);
        assert_eq!(query_name(&payload), None);
    }
}

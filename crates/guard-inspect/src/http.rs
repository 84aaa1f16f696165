//! Host-header scan for the TCP/80 fast path.

const MAX_HEAD_SCAN: usize = 8 * 1024;

/// Finds the first `Host:` header before the blank line, strips any port,
/// and lowercases it. The payload is inspected lossily: non-UTF-8 bytes
/// only prevent a match, never an error.
pub(crate) fn host_header(payload: &[u8]) -> Option<String> {
    let window = &payload[..payload.len().min(MAX_HEAD_SCAN)];
    let text = String::from_utf8_lossy(window);

    let head_end = text
        .find("\r\n\r\n")
        .or_else(|| text.find("\n\n"))
        .unwrap_or(text.len());
    let head = &text[..head_end];

    for line in head.lines().skip(1) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if !name.trim().eq_ignore_ascii_case("host") {
            continue;
        }
        let mut host = value.trim();
        if let Some(colon) = host.rfind(':') {
            if host[colon + 1..].bytes().all(|byte| byte.is_ascii_digit())
                && !host[colon + 1..].is_empty()
            {
                host = &host[..colon];
            }
        }
        if host.is_empty() {
            return None;
        }
        return Some(host.to_ascii_lowercase());
    }
    None
}

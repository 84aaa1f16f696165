//! Request-head reading and parsing for the local listener, plus the
//! canned responses the proxy writes itself.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) const DEFAULT_MAX_HEAD_BYTES: usize = 16 * 1024;
const READ_CHUNK: usize = 4 * 1024;

const BLOCKED_BODY: &str = "<html><head><title>Blocked</title></head>\
<body><h1>Request blocked</h1>\
<p>This request was blocked by ShadowGuard.</p></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestParseError {
    #[error("incomplete request head")]
    IncompleteHead,
    #[error("request head exceeds the size limit")]
    HeadTooLarge,
    #[error("request head is not valid UTF-8")]
    InvalidUtf8,
    #[error("request line must have exactly three tokens")]
    MalformedRequestLine,
    #[error("invalid CONNECT authority")]
    InvalidAuthority,
    #[error("missing or invalid port")]
    InvalidPort,
    #[error("request carries no usable host")]
    MissingHost,
}

/// The parsed head plus any bytes read past it, which belong to the next
/// protocol layer and must reach origin unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub url: String,
    /// Raw head bytes including the terminating blank line.
    pub raw_head: Vec<u8>,
    /// Bytes that arrived after the head in the same reads.
    pub leftover: Vec<u8>,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }
}

/// Reads until the header terminator (`\r\n\r\n` or `\n\n`), bounded by
/// `max_bytes`.
pub(crate) async fn read_request_head<R>(
    stream: &mut R,
    max_bytes: usize,
) -> Result<(Vec<u8>, usize), RequestParseError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        if let Some(end) = head_terminator(&buffer) {
            return Ok((buffer.to_vec(), end));
        }
        if buffer.len() >= max_bytes {
            return Err(RequestParseError::HeadTooLarge);
        }
        let read = stream
            .read_buf(&mut buffer)
            .await
            .map_err(|_| RequestParseError::IncompleteHead)?;
        if read == 0 {
            return Err(RequestParseError::IncompleteHead);
        }
    }
}

fn head_terminator(buffer: &[u8]) -> Option<usize> {
    if let Some(position) = find(buffer, b"\r\n\r\n") {
        return Some(position + 4);
    }
    find(buffer, b"\n\n").map(|position| position + 2)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub(crate) fn parse_request_head(
    buffer: &[u8],
    head_end: usize,
) -> Result<RequestHead, RequestParseError> {
    let head =
        std::str::from_utf8(&buffer[..head_end]).map_err(|_| RequestParseError::InvalidUtf8)?;
    let mut lines = head.split(['\r', '\n']).filter(|line| !line.is_empty());
    let request_line = lines.next().ok_or(RequestParseError::MalformedRequestLine)?;

    let mut tokens = request_line.split_whitespace();
    let method = tokens
        .next()
        .ok_or(RequestParseError::MalformedRequestLine)?;
    let target = tokens
        .next()
        .ok_or(RequestParseError::MalformedRequestLine)?;
    let version = tokens
        .next()
        .ok_or(RequestParseError::MalformedRequestLine)?;
    if tokens.next().is_some() {
        return Err(RequestParseError::MalformedRequestLine);
    }

    let (host, port, url) = if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = parse_authority(target)?;
        let url = format!("https://{host}/");
        (host, port, url)
    } else {
        resolve_http_target(target, head)?
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        host,
        port,
        url,
        raw_head: buffer[..head_end].to_vec(),
        leftover: buffer[head_end..].to_vec(),
    })
}

/// `host:port`, with IPv6 literals in brackets.
pub(crate) fn parse_authority(authority: &str) -> Result<(String, u16), RequestParseError> {
    if let Some(rest) = authority.strip_prefix('[') {
        let close = rest.find(']').ok_or(RequestParseError::InvalidAuthority)?;
        let host = &rest[..close];
        if host.is_empty() {
            return Err(RequestParseError::InvalidAuthority);
        }
        let port_text = rest[close + 1..]
            .strip_prefix(':')
            .ok_or(RequestParseError::InvalidPort)?;
        let port = port_text
            .parse::<u16>()
            .map_err(|_| RequestParseError::InvalidPort)?;
        return Ok((host.to_string(), port));
    }

    let (host, port_text) = authority
        .rsplit_once(':')
        .ok_or(RequestParseError::InvalidPort)?;
    if host.is_empty() || host.contains(':') {
        return Err(RequestParseError::InvalidAuthority);
    }
    let port = port_text
        .parse::<u16>()
        .map_err(|_| RequestParseError::InvalidPort)?;
    Ok((host.to_ascii_lowercase(), port))
}

/// Proxy-style requests carry an absolute URI; origin-form requests fall
/// back to the Host header.
fn resolve_http_target(
    target: &str,
    head: &str,
) -> Result<(String, u16, String), RequestParseError> {
    if let Some(rest) = target.strip_prefix("http://") {
        let authority_end = rest.find('/').unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_text)) if !port_text.is_empty() => {
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| RequestParseError::InvalidPort)?;
                (host.to_ascii_lowercase(), port)
            }
            _ => (authority.to_ascii_lowercase(), 80),
        };
        if host.is_empty() {
            return Err(RequestParseError::MissingHost);
        }
        return Ok((host, port, target.to_string()));
    }

    let host_value = head
        .lines()
        .skip(1)
        .take_while(|line| !line.trim().is_empty())
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("host")
                .then(|| value.trim().to_string())
        })
        .ok_or(RequestParseError::MissingHost)?;

    let (host, port) = match parse_authority(&host_value) {
        Ok(parsed) => parsed,
        Err(_) => (host_value.to_ascii_lowercase(), 80),
    };
    if host.is_empty() {
        return Err(RequestParseError::MissingHost);
    }
    let url = format!("http://{host}{target}");
    Ok((host, port, url))
}

/// The stable blocked-response contract: status, headers and their order
/// are part of the external interface.
pub(crate) fn blocked_response() -> Vec<u8> {
    format!(
        "HTTP/1.1 403 Forbidden\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Blocked: true\r\n\
         \r\n\
         {}",
        BLOCKED_BODY.len(),
        BLOCKED_BODY
    )
    .into_bytes()
}

pub(crate) fn redirect_response(location: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 302 Found\r\n\
         Location: {location}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n"
    )
    .into_bytes()
}

pub(crate) fn error_response(status_line: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

pub(crate) const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

#[cfg(test)]
mod tests {
    use super::{
        blocked_response, parse_authority, parse_request_head, read_request_head,
        RequestParseError,
    };

    fn parse(bytes: &[u8]) -> Result<super::RequestHead, RequestParseError> {
        let end = super::head_terminator(bytes).ok_or(RequestParseError::IncompleteHead)?;
        parse_request_head(bytes, end)
    }

    #[test]
    fn connect_request_parses_authority() {
        let head = parse(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .expect("parse");
        assert!(head.is_connect());
        assert_eq!(head.host, "example.com");
        assert_eq!(head.port, 443);
        assert_eq!(head.url, "https://example.com/");
    }

    #[test]
    fn connect_with_bracketed_ipv6_literal() {
        let (host, port) = parse_authority("[2001:db8::1]:8443").expect("parse");
        assert_eq!(host, "2001:db8::1");
        assert_eq!(port, 8443);

        assert_eq!(
            parse_authority("2001:db8::1:443").unwrap_err(),
            RequestParseError::InvalidAuthority
        );
    }

    #[test]
    fn absolute_form_get_resolves_host_and_url() {
        let head = parse(
            b"GET http://tracker.example.com/pixel.gif HTTP/1.1\r\nHost: tracker.example.com\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.host, "tracker.example.com");
        assert_eq!(head.port, 80);
        assert_eq!(head.url, "http://tracker.example.com/pixel.gif");
    }

    #[test]
    fn origin_form_get_uses_host_header() {
        let head =
            parse(b"GET /index.html HTTP/1.1\r\nHost: www.example.com:8080\r\n\r\n").expect("parse");
        assert_eq!(head.host, "www.example.com");
        assert_eq!(head.port, 8080);
        assert_eq!(head.url, "http://www.example.com/index.html");
    }

    #[test]
    fn request_line_must_have_three_tokens() {
        assert_eq!(
            parse(b"GET /\r\n\r\n").unwrap_err(),
            RequestParseError::MalformedRequestLine
        );
        assert_eq!(
            parse(b"GET / HTTP/1.1 extra\r\n\r\n").unwrap_err(),
            RequestParseError::MalformedRequestLine
        );
    }

    #[test]
    fn leftover_bytes_survive_parsing() {
        let head = parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01").expect("parse");
        assert_eq!(head.leftover, vec![0x16, 0x03, 0x01]);
    }

    #[test]
    fn blocked_response_matches_wire_contract() {
        let response = String::from_utf8(blocked_response()).expect("utf8");
        let mut lines = response.split("\r\n");
        assert_eq!(lines.next(), Some("HTTP/1.1 403 Forbidden"));
        assert_eq!(
            lines.next(),
            Some("Content-Type: text/html; charset=utf-8")
        );
        assert!(lines.next().unwrap().starts_with("Content-Length: "));
        assert_eq!(lines.next(), Some("Connection: close"));
        assert_eq!(lines.next(), Some("X-Blocked: true"));
        assert_eq!(lines.next(), Some(""));
        assert!(lines.next().unwrap().starts_with("<html>"));
    }

    #[tokio::test]
    async fn oversized_heads_are_rejected() {
        let huge = vec![b'a'; 64 * 1024];
        let mut reader = std::io::Cursor::new(huge);
        let error = read_request_head(&mut reader, 16 * 1024).await.unwrap_err();
        assert_eq!(error, RequestParseError::HeadTooLarge);
    }

    #[tokio::test]
    async fn lf_only_terminator_is_accepted() {
        let mut reader = std::io::Cursor::new(b"GET / HTTP/1.1\nHost: x.example\n\nrest".to_vec());
        let (buffer, end) = read_request_head(&mut reader, 16 * 1024)
            .await
            .expect("read");
        let head = parse_request_head(&buffer, end).expect("parse");
        assert_eq!(head.host, "x.example");
        assert_eq!(head.leftover, b"rest".to_vec());
    }
}

//! HTTP/1.x request detection and head decoding.
//!
//! The routing key is the `Host` header (port stripped, lowercased). When the
//! header is missing, an absolute-form request target supplies the authority.
//! The full request head is retained so an interception hook can inspect or
//! rewrite it before it is replayed to the backend.

use tracing::debug;

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol, Rejection};

/// Largest request or response head accepted.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 100;

const METHODS: &[&[u8]] = &[
    b"GET ",
    b"HEAD ",
    b"POST ",
    b"PUT ",
    b"DELETE ",
    b"OPTIONS ",
    b"TRACE ",
    b"CONNECT ",
    b"PATCH ",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpProtocol;

impl Protocol for HttpProtocol {
    fn name(&self) -> &'static str {
        "http"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["http"]
    }

    fn max_identification_length(&self) -> usize {
        METHODS.iter().map(|m| m.len()).max().unwrap_or(0)
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        METHODS.iter().any(|m| prefix.starts_with(m))
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(HttpDecoder::default())
    }

    fn rejection(&self, _params: &ConnectionParameters, rejection: &Rejection) -> Option<Vec<u8>> {
        let bytes = match rejection {
            Rejection::NoService => response(404, "no service is registered for this host\n"),
            Rejection::Unavailable => response(502, "no backend for this host is reachable\n"),
            Rejection::Policy { status, message } => response(*status, message),
        };
        Some(bytes)
    }
}

/// Decoded request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor version (`1` for HTTP/1.1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Bytes of the original head, terminator included.
    pub head_len: usize,
}

impl RequestHead {
    /// First value of a header (case-insensitive name).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Routing host: `Host` header, else the authority of an absolute URI.
    pub fn host(&self) -> Option<String> {
        let raw = match self.header("host") {
            Some(h) => h.to_string(),
            None => authority_of(&self.path)?,
        };
        normalize_host(&raw)
    }

    /// Serialize the head, e.g. after headers were rewritten.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Decoded status line and headers of a backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub head_len: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.{} {} {}\r\n", self.version, self.status, self.reason);
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// Incremental request head decoder.
#[derive(Debug, Default)]
pub struct HttpDecoder {
    buffer: Vec<u8>,
    /// Bytes already searched for the head terminator.
    scanned: usize,
}

impl FrameDecoder for HttpDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        let from = self.scanned.saturating_sub(3);
        if head_end(&self.buffer[from..]).is_none() {
            self.scanned = self.buffer.len();
            if self.buffer.len() > MAX_HEAD_BYTES {
                return Err(DecodeError::FrameTooLarge {
                    protocol: "http",
                    size: self.buffer.len(),
                    limit: MAX_HEAD_BYTES,
                });
            }
            return Ok(Decoded::NeedMore);
        }

        let Some(head) = parse_request_head(&self.buffer)? else {
            return Ok(Decoded::NeedMore);
        };

        debug!(method = %head.method, path = %head.path, "HTTP request head decoded");

        let params = ConnectionParameters::new("http").with_virtual_host(head.host());
        Ok(Decoded::Complete(ConnectionParameters {
            request: Some(head),
            ..params
        }))
    }
}

/// Parse a request head, `None` if incomplete.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Ok(Some(RequestHead {
            method: req.method.unwrap_or("").to_string(),
            path: req.path.unwrap_or("").to_string(),
            version: req.version.unwrap_or(1),
            headers: collect_headers(req.headers),
            head_len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(DecodeError::malformed("http", e.to_string())),
    }
}

/// Parse a response head, `None` if incomplete.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, DecodeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    match resp.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Ok(Some(ResponseHead {
            status: resp.code.unwrap_or(0),
            reason: resp.reason.unwrap_or("").to_string(),
            version: resp.version.unwrap_or(1),
            headers: collect_headers(resp.headers),
            head_len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(DecodeError::malformed("http", e.to_string())),
    }
}

/// Render a minimal `Connection: close` response with a text body.
pub fn response(status: u16, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    )
    .into_bytes()
}

/// Position just past the head terminator (`\r\n\r\n` or `\n\n`).
pub fn head_end(buf: &[u8]) -> Option<usize> {
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    match (crlf, lf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

fn collect_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn authority_of(target: &str) -> Option<String> {
    let (_, rest) = target.split_once("://")?;
    let authority = rest.split(['/', '?', '#']).next()?;
    let authority = authority.rsplit('@').next()?;
    Some(authority.to_string())
}

/// Lowercase, drop the port and any trailing dot.
fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if raw.starts_with('[') {
        // IPv6 literal
        match raw.find(']') {
            Some(end) => &raw[..=end],
            None => raw,
        }
    } else {
        raw.split(':').next().unwrap_or(raw)
    };
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Decoded, DecodeError> {
        HttpDecoder::default().decode(bytes)
    }

    #[test]
    fn test_host_header_is_routing_key() {
        let req = b"GET /index.html HTTP/1.1\r\nHost: Foo.Example:8080\r\nAccept: */*\r\n\r\n";
        match decode_all(req).unwrap() {
            Decoded::Complete(params) => {
                assert_eq!(params.protocol, "http");
                assert_eq!(params.virtual_host.as_deref(), Some("foo.example"));
                let head = params.request.unwrap();
                assert_eq!(head.method, "GET");
                assert_eq!(head.path, "/index.html");
                assert_eq!(head.head_len, req.len());
            }
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_host_uses_absolute_uri() {
        let req = b"GET http://proxy.test/x HTTP/1.0\r\n\r\n";
        match decode_all(req).unwrap() {
            Decoded::Complete(params) => {
                assert_eq!(params.virtual_host.as_deref(), Some("proxy.test"));
            }
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_no_host_at_all() {
        match decode_all(b"GET / HTTP/1.0\r\n\r\n").unwrap() {
            Decoded::Complete(params) => assert!(params.virtual_host.is_none()),
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_head_needs_more() {
        let mut decoder = HttpDecoder::default();
        assert_eq!(decoder.decode(b"GET / HTTP/1.1\r\nHost: a").unwrap(), Decoded::NeedMore);
        assert_eq!(decoder.decode(b"\r\n\r").unwrap(), Decoded::NeedMore);
        assert!(matches!(decoder.decode(b"\n").unwrap(), Decoded::Complete(_)));
    }

    #[test]
    fn test_malformed_head() {
        let err = decode_all(b"GET / HTTP/1.1\r\nBad Header\r\n\r\n").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { protocol: "http", .. }));
    }

    #[test]
    fn test_oversized_head() {
        let mut decoder = HttpDecoder::default();
        decoder.decode(b"GET / HTTP/1.1\r\n").unwrap();
        let filler = vec![b'a'; MAX_HEAD_BYTES];
        let err = decoder.decode(&filler).unwrap_err();
        assert!(matches!(err, DecodeError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_ipv6_host() {
        assert_eq!(normalize_host("[::1]:80").as_deref(), Some("[::1]"));
        assert_eq!(normalize_host("Example.COM.").as_deref(), Some("example.com"));
    }

    #[test]
    fn test_encode_round_trips_through_parser() {
        let head = parse_request_head(b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .unwrap()
            .unwrap();
        let reparsed = parse_request_head(&head.encode()).unwrap().unwrap();
        assert_eq!(reparsed.headers, head.headers);
        assert_eq!(reparsed.method, "POST");
    }

    #[test]
    fn test_rejection_responses() {
        let params = ConnectionParameters::new("http");
        let not_found = HttpProtocol.rejection(&params, &Rejection::NoService).unwrap();
        assert!(not_found.starts_with(b"HTTP/1.1 404 Not Found\r\n"));
        let bad_gateway = HttpProtocol.rejection(&params, &Rejection::Unavailable).unwrap();
        assert!(bad_gateway.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));

        let parsed = parse_response_head(&not_found).unwrap().unwrap();
        assert_eq!(parsed.status, 404);
        assert_eq!(parsed.header("connection"), Some("close"));
    }
}

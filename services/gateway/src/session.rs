//! Per-connection state machine.
//!
//! A [`ConnectionSession`] knows nothing about sockets. The listener feeds it
//! whatever it reads and asks it what to do next:
//!
//! ```text
//! AwaitingBytes -> ProtocolDetected -> RoutingResolved -> Bridging -> Closed
//!       |                 |                  |
//!       +-----------------+------------------+-------------------> Closed
//! ```
//!
//! Every byte read before bridging is kept so it can be replayed, unmodified,
//! to the chosen backend.

use protogate_detect::http::RequestHead;
use protogate_detect::{
    ConnectionParameters, Decoded, FrameDecoder, MatchOutcome, ProtocolMatcher, SharedProtocol,
};
use std::sync::Arc;
use tracing::debug;

use crate::error::GatewayError;
use crate::registry::{normalize_host, RouteKey};

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The bridge ran to completion.
    Completed,
    /// Terminal failure, by reason code.
    Failure(&'static str),
}

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingBytes,
    ProtocolDetected,
    RoutingResolved,
    Bridging,
    Closed(CloseReason),
}

/// Result of feeding bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Read more from the client.
    NeedMore,
    /// The routing key is known.
    Resolved,
}

/// Session settings shared by every connection of a listener.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub matcher: Arc<ProtocolMatcher>,
    /// Used when the handshake names no virtual host.
    pub default_virtual_host: Option<String>,
    /// Bound on bytes buffered before routing.
    pub max_handshake_bytes: usize,
}

/// Routing state of one accepted connection.
pub struct ConnectionSession {
    settings: SessionSettings,
    state: SessionState,
    prefix: Vec<u8>,
    protocol: Option<SharedProtocol>,
    decoder: Option<Box<dyn FrameDecoder>>,
    params: Option<ConnectionParameters>,
}

impl ConnectionSession {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: SessionState::AwaitingBytes,
            prefix: Vec::new(),
            protocol: None,
            decoder: None,
            params: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn protocol(&self) -> Option<&SharedProtocol> {
        self.protocol.as_ref()
    }

    pub fn params(&self) -> Option<&ConnectionParameters> {
        self.params.as_ref()
    }

    /// Bytes read so far that will be replayed.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed(_))
    }

    /// Feed bytes read from the client.
    ///
    /// On error the session is closed and the error returned.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Progress, GatewayError> {
        match self.state {
            SessionState::AwaitingBytes | SessionState::ProtocolDetected => {}
            _ => return Ok(Progress::Resolved),
        }

        if self.prefix.len() + bytes.len() > self.settings.max_handshake_bytes {
            return Err(self.fail(GatewayError::HandshakeTooLarge {
                limit: self.settings.max_handshake_bytes,
            }));
        }
        self.prefix.extend_from_slice(bytes);

        let decoded = match self.decoder.as_mut() {
            // Only the new bytes; the decoder already saw the rest.
            Some(decoder) => decoder.decode(bytes),
            None => match self.settings.matcher.detect(&self.prefix) {
                MatchOutcome::NoMatchYet => return Ok(Progress::NeedMore),
                MatchOutcome::NoneMatched => {
                    let prefix_len = self.prefix.len();
                    return Err(self.fail(GatewayError::UnidentifiedProtocol { prefix_len }));
                }
                MatchOutcome::Matched(protocol) => {
                    debug!(protocol = protocol.name(), "Protocol detected");
                    self.state = SessionState::ProtocolDetected;
                    let mut decoder = protocol.decoder();
                    self.protocol = Some(protocol);
                    let decoded = decoder.decode(&self.prefix);
                    self.decoder = Some(decoder);
                    decoded
                }
            },
        };

        match decoded {
            Ok(Decoded::NeedMore) => Ok(Progress::NeedMore),
            Ok(Decoded::Complete(params)) => {
                self.resolve(params);
                Ok(Progress::Resolved)
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }

    fn resolve(&mut self, mut params: ConnectionParameters) {
        if params.virtual_host.is_none() {
            params.virtual_host = self.settings.default_virtual_host.clone();
        }
        debug!(
            protocol = %params.protocol,
            virtual_host = ?params.virtual_host,
            user = ?params.user,
            "Routing key resolved"
        );
        self.params = Some(params);
        self.decoder = None;
        self.state = SessionState::RoutingResolved;
    }

    /// Registry key for the resolved route.
    pub fn route_key(&self) -> Option<RouteKey> {
        let protocol = self.protocol.as_ref()?;
        let params = self.params.as_ref()?;
        Some(RouteKey::new(
            protocol.scheme(),
            params
                .virtual_host
                .as_deref()
                .map(normalize_host)
                .unwrap_or_default(),
        ))
    }

    /// Decoded HTTP request head, if the protocol was HTTP.
    pub fn request_head(&self) -> Option<&RequestHead> {
        self.params.as_ref()?.request.as_ref()
    }

    /// Replace the HTTP request head in the replay buffer with new headers.
    pub fn rewrite_request_headers(&mut self, headers: Vec<(String, String)>) -> bool {
        let Some(request) = self.params.as_mut().and_then(|p| p.request.as_mut()) else {
            return false;
        };
        let body = self.prefix.split_off(request.head_len.min(self.prefix.len()));
        request.headers = headers;
        let head = request.encode();
        request.head_len = head.len();
        self.prefix = head;
        self.prefix.extend_from_slice(&body);
        true
    }

    /// Enter `Bridging`, handing out the buffered prefix for replay.
    pub fn begin_bridging(&mut self) -> Vec<u8> {
        if self.state != SessionState::RoutingResolved {
            return Vec::new();
        }
        self.state = SessionState::Bridging;
        std::mem::take(&mut self.prefix)
    }

    /// Close the session. Returns `false` if it was already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.is_closed() {
            return false;
        }
        debug!(reason = ?reason, "Session closed");
        self.state = SessionState::Closed(reason);
        self.decoder = None;
        self.prefix = Vec::new();
        true
    }

    /// Close with the error's reason code and hand the error back.
    pub fn fail(&mut self, error: GatewayError) -> GatewayError {
        self.close(CloseReason::Failure(error.reason_code()));
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protogate_detect::default_protocols;

    fn session(default_vhost: Option<&str>) -> ConnectionSession {
        ConnectionSession::new(SessionSettings {
            matcher: Arc::new(ProtocolMatcher::new(default_protocols())),
            default_virtual_host: default_vhost.map(String::from),
            max_handshake_bytes: 1024,
        })
    }

    const STOMP: &[u8] = b"CONNECT\naccept-version:1.2\nhost:broker0\n\n\0";

    #[test]
    fn test_stomp_byte_by_byte() {
        let mut s = session(None);
        let mut last = Progress::NeedMore;
        for (i, b) in STOMP.iter().enumerate() {
            last = s.feed(&[*b]).unwrap();
            if i < 7 {
                assert_eq!(s.state(), &SessionState::AwaitingBytes);
            }
            if last == Progress::Resolved {
                break;
            }
        }
        assert_eq!(last, Progress::Resolved);
        assert_eq!(s.state(), &SessionState::RoutingResolved);
        assert_eq!(s.route_key(), Some(RouteKey::new("stomp", "broker0")));
        assert_eq!(s.begin_bridging(), STOMP.to_vec());
        assert_eq!(s.state(), &SessionState::Bridging);
    }

    #[test]
    fn test_amqp_header_needs_more() {
        let mut s = session(None);
        assert_eq!(s.feed(b"AMQP").unwrap(), Progress::NeedMore);
        assert_eq!(s.state(), &SessionState::ProtocolDetected);
        assert_eq!(s.protocol().unwrap().name(), "amqp");
    }

    #[test]
    fn test_unidentified_protocol_closes() {
        let mut s = session(None);
        let err = s.feed(b"\x00\x00\x00\x00zzzzzzzzzzzzzzzz").unwrap_err();
        assert!(matches!(err, GatewayError::UnidentifiedProtocol { .. }));
        assert_eq!(
            s.state(),
            &SessionState::Closed(CloseReason::Failure("unidentified_protocol"))
        );
        assert!(s.prefix().is_empty());
    }

    #[test]
    fn test_decode_error_closes() {
        let mut s = session(None);
        let err = s.feed(b"CONNECT\nbad header line\n\n\0").unwrap_err();
        assert_eq!(err.reason_code(), "decode_error");
        assert!(s.is_closed());
    }

    #[test]
    fn test_default_virtual_host_applied() {
        let mut s = session(Some("fallback"));
        s.feed(b"CONNECT\naccept-version:1.2\n\n\0").unwrap();
        assert_eq!(s.route_key(), Some(RouteKey::new("stomp", "fallback")));
    }

    #[test]
    fn test_handshake_bound() {
        let mut s = session(None);
        s.feed(b"GET / HTTP/1.1\r\n").unwrap();
        let err = s.feed(&[b'a'; 2048]).unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeTooLarge { limit: 1024 }));
    }

    #[test]
    fn test_close_idempotent() {
        let mut s = session(None);
        assert!(s.close(CloseReason::Completed));
        assert!(!s.close(CloseReason::Failure("io_error")));
        assert_eq!(s.state(), &SessionState::Closed(CloseReason::Completed));
    }

    #[test]
    fn test_rewrite_request_headers_keeps_body() {
        let mut s = session(None);
        s.feed(b"POST /x HTTP/1.1\r\nHost: api\r\nContent-Length: 2\r\n\r\nhi")
            .unwrap();
        let mut headers = s.request_head().unwrap().headers.clone();
        headers.push(("X-Gateway".into(), "protogate".into()));
        assert!(s.rewrite_request_headers(headers));

        let replay = s.begin_bridging();
        let text = String::from_utf8(replay).unwrap();
        assert!(text.starts_with("POST /x HTTP/1.1\r\nHost: api\r\n"));
        assert!(text.contains("X-Gateway: protogate\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }
}

//! STOMP `CONNECT`/`STOMP` frame decoding.
//!
//! Only the frame headers are needed: the `host` header names the virtual
//! host and `login` the user. `CONNECT` frames are never header-escaped, so
//! values are taken verbatim. The first occurrence of a repeated header wins.

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol, Rejection};

/// Largest frame head (command plus headers) accepted.
pub const MAX_FRAME_HEAD_BYTES: usize = 64 * 1024;

const SIGNATURES: &[&[u8]] = &[b"CONNECT\n", b"CONNECT\r\n", b"STOMP\n", b"STOMP\r\n"];

#[derive(Debug, Clone, Copy, Default)]
pub struct StompProtocol;

impl Protocol for StompProtocol {
    fn name(&self) -> &'static str {
        "stomp"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["stomp", "stomp+nio"]
    }

    fn max_identification_length(&self) -> usize {
        SIGNATURES.iter().map(|s| s.len()).max().unwrap_or(0)
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        SIGNATURES.iter().any(|s| prefix.starts_with(s))
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(StompDecoder::default())
    }

    fn rejection(&self, _params: &ConnectionParameters, rejection: &Rejection) -> Option<Vec<u8>> {
        let message = match rejection {
            Rejection::NoService => "no broker is registered for this host".to_string(),
            Rejection::Unavailable => "no broker for this host is reachable".to_string(),
            Rejection::Policy { message, .. } => message.replace(['\n', '\r'], " "),
        };
        Some(error_frame(&message))
    }
}

/// Render a STOMP `ERROR` frame.
pub fn error_frame(message: &str) -> Vec<u8> {
    let body = format!("{message}\n");
    let mut frame = format!(
        "ERROR\ncontent-type:text/plain\ncontent-length:{}\nmessage:{}\n\n{}",
        body.len(),
        message,
        body
    )
    .into_bytes();
    frame.push(0);
    frame
}

#[derive(Debug, Default)]
pub struct StompDecoder {
    buffer: Vec<u8>,
    scanned: usize,
}

impl FrameDecoder for StompDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        let from = self.scanned.saturating_sub(3);
        let Some(end) = crate::http::head_end(&self.buffer[from..]).map(|e| e + from) else {
            self.scanned = self.buffer.len();
            if self.buffer.len() > MAX_FRAME_HEAD_BYTES {
                return Err(DecodeError::FrameTooLarge {
                    protocol: "stomp",
                    size: self.buffer.len(),
                    limit: MAX_FRAME_HEAD_BYTES,
                });
            }
            return Ok(Decoded::NeedMore);
        };

        parse_connect_head(&self.buffer[..end]).map(Decoded::Complete)
    }
}

fn parse_connect_head(head: &[u8]) -> Result<ConnectionParameters, DecodeError> {
    let text = std::str::from_utf8(head)
        .map_err(|_| DecodeError::malformed("stomp", "frame head is not UTF-8"))?;

    let mut lines = text
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .skip_while(|l| l.is_empty());

    match lines.next() {
        Some("CONNECT") | Some("STOMP") => {}
        Some(other) => {
            return Err(DecodeError::malformed(
                "stomp",
                format!("expected CONNECT or STOMP, got {other:?}"),
            ))
        }
        None => return Err(DecodeError::malformed("stomp", "empty frame")),
    }

    let mut host = None;
    let mut login = None;

    for line in lines.take_while(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            return Err(DecodeError::malformed(
                "stomp",
                format!("header line without ':': {line:?}"),
            ));
        };
        match key {
            "host" if host.is_none() => host = Some(value.trim().to_string()),
            "login" if login.is_none() => login = Some(value.to_string()),
            _ => {}
        }
    }

    Ok(ConnectionParameters::new("stomp")
        .with_virtual_host(host)
        .with_user(login))
}

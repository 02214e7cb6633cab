//! TLS ClientHello sniffing.
//!
//! Used when TLS is routed opaquely: the gateway never decrypts, it only
//! reads the server name (SNI) from the ClientHello and forwards the
//! encrypted bytes untouched to a backend that terminates TLS itself.
//!
//! TLS record structure:
//! - byte 0: record type (0x16 = Handshake)
//! - bytes 1-2: version
//! - bytes 3-4: record length
//! - bytes 5+: handshake fragment
//!
//! ClientHello (after the 4-byte handshake header):
//! - 2 bytes: client version
//! - 32 bytes: random
//! - 1 byte + variable: session ID
//! - 2 bytes + variable: cipher suites
//! - 1 byte + variable: compression methods
//! - 2 bytes + variable: extensions
//!
//! A ClientHello may be fragmented across several records; fragments are
//! joined before parsing.

use tracing::debug;

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol};
use crate::wire::{Cursor, Truncated};

/// Largest ClientHello accepted (all fragments together).
pub const MAX_CLIENT_HELLO_BYTES: usize = 64 * 1024;

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const RECORD_HEADER_LEN: usize = 5;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone, Copy, Default)]
pub struct TlsProtocol;

impl Protocol for TlsProtocol {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["tls", "ssl"]
    }

    fn max_identification_length(&self) -> usize {
        RECORD_HEADER_LEN + 1
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix.len() >= self.max_identification_length()
            && prefix[0] == RECORD_HANDSHAKE
            && prefix[1] == 0x03
            && prefix[2] <= 0x04
            && prefix[5] == HANDSHAKE_CLIENT_HELLO
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(TlsDecoder::default())
    }
}

/// Does the first byte look like a TLS handshake record?
pub fn is_handshake_record(first_byte: u8) -> bool {
    first_byte == RECORD_HANDSHAKE
}

#[derive(Debug, Default)]
pub struct TlsDecoder {
    buffer: Vec<u8>,
    /// Start of the next unread record in `buffer`.
    offset: usize,
    /// Handshake bytes joined from record fragments.
    handshake: Vec<u8>,
}

impl FrameDecoder for TlsDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        loop {
            let pending = &self.buffer[self.offset..];
            if pending.len() < RECORD_HEADER_LEN {
                return Ok(Decoded::NeedMore);
            }
            if pending[0] != RECORD_HANDSHAKE {
                return Err(DecodeError::malformed(
                    "tls",
                    format!("record type {:#04x} before ClientHello completed", pending[0]),
                ));
            }
            let record_len = u16::from_be_bytes([pending[3], pending[4]]) as usize;
            if pending.len() < RECORD_HEADER_LEN + record_len {
                return Ok(Decoded::NeedMore);
            }

            self.handshake
                .extend_from_slice(&pending[RECORD_HEADER_LEN..RECORD_HEADER_LEN + record_len]);
            self.offset += RECORD_HEADER_LEN + record_len;

            if self.handshake.len() > MAX_CLIENT_HELLO_BYTES {
                return Err(DecodeError::FrameTooLarge {
                    protocol: "tls",
                    size: self.handshake.len(),
                    limit: MAX_CLIENT_HELLO_BYTES,
                });
            }

            if self.handshake.len() < 4 {
                continue;
            }
            if self.handshake[0] != HANDSHAKE_CLIENT_HELLO {
                return Err(DecodeError::malformed("tls", "first handshake message is not ClientHello"));
            }
            let hello_len = ((self.handshake[1] as usize) << 16)
                | ((self.handshake[2] as usize) << 8)
                | (self.handshake[3] as usize);
            if self.handshake.len() < 4 + hello_len {
                continue;
            }

            let sni = parse_client_hello(&self.handshake[4..4 + hello_len])
                .map_err(|_| DecodeError::malformed("tls", "ClientHello truncated"))?;
            debug!(sni = ?sni, "ClientHello parsed");

            return Ok(Decoded::Complete(
                ConnectionParameters::new("tls").with_virtual_host(sni),
            ));
        }
    }
}

/// Extract the SNI host name, normalized to lowercase without trailing dot.
fn parse_client_hello(hello: &[u8]) -> Result<Option<String>, Truncated> {
    let mut c = Cursor::new(hello);

    // version + random
    c.skip(2 + 32)?;
    let session_id_len = c.u8()? as usize;
    c.skip(session_id_len)?;
    let cipher_suites_len = c.u16()? as usize;
    c.skip(cipher_suites_len)?;
    let compression_len = c.u8()? as usize;
    c.skip(compression_len)?;

    if c.rest().is_empty() {
        // No extensions
        return Ok(None);
    }
    let extensions_len = c.u16()? as usize;
    let mut extensions = Cursor::new(c.take(extensions_len)?);

    while !extensions.rest().is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext = extensions.take(ext_len)?;
        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name(ext);
        }
    }

    Ok(None)
}

/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn parse_server_name(ext: &[u8]) -> Result<Option<String>, Truncated> {
    let mut c = Cursor::new(ext);
    let list_len = c.u16()? as usize;
    let mut list = Cursor::new(c.take(list_len)?);

    while !list.rest().is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;
        if name_type == NAME_TYPE_HOST {
            let Ok(hostname) = std::str::from_utf8(name) else {
                return Err(Truncated);
            };
            return Ok(Some(hostname.to_lowercase().trim_end_matches('.').to_string()));
        }
    }

    Ok(None)
}

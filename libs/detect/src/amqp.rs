//! AMQP 1.0 handshake decoding.
//!
//! A client opens with an 8-byte protocol header. Protocol id `3` announces
//! a SASL layer: the routing key then comes from the `sasl-init` frame (its
//! `hostname` field, and the user from a PLAIN initial response). Protocol
//! id `0` goes straight to the connection: the `open` frame's `hostname`
//! field is the virtual host. The decoder resolves on whichever of the two
//! performatives arrives first.
//!
//! Frames are decoded from their published wire format:
//!
//! ```text
//! +----------+------+------+---------+----------------+------+
//! | size u32 | doff | type | channel | extended header| body |
//! +----------+------+------+---------+----------------+------+
//! ```

use tracing::trace;

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol};
use crate::wire::{Cursor, Truncated};

/// Largest frame accepted before the connection is open.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

const HEADER_LEN: usize = 8;
const FRAME_HEADER_LEN: usize = 8;

const PROTOCOL_ID_AMQP: u8 = 0;
const PROTOCOL_ID_TLS: u8 = 2;
const PROTOCOL_ID_SASL: u8 = 3;

const FRAME_TYPE_AMQP: u8 = 0;
const FRAME_TYPE_SASL: u8 = 1;

const DESCRIPTOR_OPEN: u64 = 0x10;
const DESCRIPTOR_SASL_INIT: u64 = 0x41;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpProtocol;

impl Protocol for AmqpProtocol {
    fn name(&self) -> &'static str {
        "amqp"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["amqp", "amqp+nio"]
    }

    fn max_identification_length(&self) -> usize {
        HEADER_LEN
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix.starts_with(b"AMQP")
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(AmqpDecoder::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Header,
    Sasl,
    Connection,
}

#[derive(Debug)]
pub struct AmqpDecoder {
    buffer: Vec<u8>,
    /// Start of the first unconsumed frame.
    offset: usize,
    layer: Layer,
}

impl Default for AmqpDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            offset: 0,
            layer: Layer::Header,
        }
    }
}

impl FrameDecoder for AmqpDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        loop {
            let pending = &self.buffer[self.offset..];

            if self.layer == Layer::Header {
                if pending.len() < HEADER_LEN {
                    return Ok(Decoded::NeedMore);
                }
                self.layer = parse_protocol_header(&pending[..HEADER_LEN])?;
                self.offset += HEADER_LEN;
                continue;
            }

            if pending.len() < 4 {
                return Ok(Decoded::NeedMore);
            }
            let size = u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
            if size < FRAME_HEADER_LEN {
                return Err(DecodeError::malformed("amqp", format!("frame size {size} below minimum")));
            }
            if size > MAX_FRAME_BYTES {
                return Err(DecodeError::FrameTooLarge {
                    protocol: "amqp",
                    size,
                    limit: MAX_FRAME_BYTES,
                });
            }
            if pending.len() < size {
                return Ok(Decoded::NeedMore);
            }

            let frame = &pending[..size];
            self.offset += size;

            if let Some(params) = self.on_frame(frame)? {
                return Ok(Decoded::Complete(params));
            }
        }
    }
}

impl AmqpDecoder {
    fn on_frame(&self, frame: &[u8]) -> Result<Option<ConnectionParameters>, DecodeError> {
        let doff = frame[4] as usize * 4;
        let frame_type = frame[5];
        if doff < FRAME_HEADER_LEN || doff > frame.len() {
            return Err(DecodeError::malformed("amqp", format!("bad data offset {doff}")));
        }

        let body = &frame[doff..];
        if body.is_empty() {
            // heartbeat
            return Ok(None);
        }

        let expected_type = match self.layer {
            Layer::Sasl => FRAME_TYPE_SASL,
            _ => FRAME_TYPE_AMQP,
        };
        if frame_type != expected_type {
            return Err(DecodeError::malformed(
                "amqp",
                format!("unexpected frame type {frame_type} in {:?} layer", self.layer),
            ));
        }

        let truncated = |_| DecodeError::malformed("amqp", "performative truncated");
        let mut c = Cursor::new(body);
        let descriptor = read_descriptor(&mut c)?;
        trace!(descriptor, layer = ?self.layer, "AMQP performative");

        match (self.layer, descriptor) {
            (Layer::Sasl, DESCRIPTOR_SASL_INIT) => {
                let mut fields = ListFields::open(&mut c).map_err(truncated)?;
                let mechanism = fields.next_bytes(&mut c)?;
                let initial_response = fields.next_bytes(&mut c)?;
                let hostname = fields.next_bytes(&mut c)?;

                let user = match (mechanism.as_deref(), initial_response) {
                    (Some(b"PLAIN"), Some(response)) => plain_user(&response),
                    _ => None,
                };

                Ok(Some(
                    ConnectionParameters::new("amqp")
                        .with_virtual_host(hostname.map(lossy))
                        .with_user(user),
                ))
            }
            (Layer::Sasl, _) => Ok(None),
            (_, DESCRIPTOR_OPEN) => {
                let mut fields = ListFields::open(&mut c).map_err(truncated)?;
                let _container_id = fields.next_bytes(&mut c)?;
                let hostname = fields.next_bytes(&mut c)?;

                Ok(Some(
                    ConnectionParameters::new("amqp").with_virtual_host(hostname.map(lossy)),
                ))
            }
            (_, other) => Err(DecodeError::malformed(
                "amqp",
                format!("expected open performative, got descriptor {other:#x}"),
            )),
        }
    }
}

fn parse_protocol_header(header: &[u8]) -> Result<Layer, DecodeError> {
    if &header[..4] != b"AMQP" {
        return Err(DecodeError::malformed("amqp", "missing AMQP magic"));
    }
    let (id, major, minor) = (header[4], header[5], header[6]);
    if major != 1 || minor != 0 {
        return Err(DecodeError::malformed(
            "amqp",
            format!("unsupported AMQP version {}.{}.{}", header[5], header[6], header[7]),
        ));
    }
    match id {
        PROTOCOL_ID_AMQP => Ok(Layer::Connection),
        PROTOCOL_ID_SASL => Ok(Layer::Sasl),
        PROTOCOL_ID_TLS => Err(DecodeError::malformed(
            "amqp",
            "in-band TLS upgrade is not supported",
        )),
        other => Err(DecodeError::malformed("amqp", format!("unknown protocol id {other}"))),
    }
}

/// PLAIN initial response is `authzid NUL authcid NUL passwd`.
fn plain_user(response: &[u8]) -> Option<String> {
    let mut parts = response.split(|b| *b == 0);
    let authzid = parts.next()?;
    let authcid = parts.next()?;
    let user = if authcid.is_empty() { authzid } else { authcid };
    Some(lossy(user.to_vec()))
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn read_descriptor(c: &mut Cursor<'_>) -> Result<u64, DecodeError> {
    let truncated = |_| DecodeError::malformed("amqp", "descriptor truncated");
    if c.u8().map_err(truncated)? != 0x00 {
        return Err(DecodeError::malformed("amqp", "performative is not a described type"));
    }
    match c.u8().map_err(truncated)? {
        0x44 => Ok(0),
        0x53 => Ok(c.u8().map_err(truncated)? as u64),
        0x80 => {
            let hi = c.u32().map_err(truncated)? as u64;
            let lo = c.u32().map_err(truncated)? as u64;
            Ok(hi << 32 | lo)
        }
        code @ (0xa3 | 0xb3) => {
            let len = if code == 0xa3 {
                c.u8().map_err(truncated)? as usize
            } else {
                c.u32().map_err(truncated)? as usize
            };
            match c.take(len).map_err(truncated)? {
                b"amqp:open:list" => Ok(DESCRIPTOR_OPEN),
                b"amqp:sasl-init:list" => Ok(DESCRIPTOR_SASL_INIT),
                _ => Ok(u64::MAX),
            }
        }
        other => Err(DecodeError::malformed(
            "amqp",
            format!("unsupported descriptor constructor {other:#04x}"),
        )),
    }
}

/// Positional access to the fields of a described list.
struct ListFields {
    remaining: usize,
}

impl ListFields {
    fn open(c: &mut Cursor<'_>) -> Result<Self, Truncated> {
        let count = match c.u8()? {
            0x45 => 0,
            0xc0 => {
                let _size = c.u8()?;
                c.u8()? as usize
            }
            0xd0 => {
                let _size = c.u32()?;
                c.u32()? as usize
            }
            _ => return Err(Truncated),
        };
        Ok(Self { remaining: count })
    }

    /// Next field as raw bytes (string, symbol or binary); `None` for null
    /// or absent trailing fields.
    fn next_bytes(&mut self, c: &mut Cursor<'_>) -> Result<Option<Vec<u8>>, DecodeError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        let truncated = |_| DecodeError::malformed("amqp", "field truncated");
        let code = c.u8().map_err(truncated)?;
        let len = match code {
            0x40 => return Ok(None),
            0xa0 | 0xa1 | 0xa3 => c.u8().map_err(truncated)? as usize,
            0xb0 | 0xb1 | 0xb3 => c.u32().map_err(truncated)? as usize,
            other => {
                skip_value(c, other).map_err(truncated)?;
                return Ok(None);
            }
        };
        Ok(Some(c.take(len).map_err(truncated)?.to_vec()))
    }
}

/// Skip an encoded value whose constructor byte was already read.
fn skip_value(c: &mut Cursor<'_>, code: u8) -> Result<(), Truncated> {
    match code {
        0x00 => {
            let descriptor = c.u8()?;
            skip_value(c, descriptor)?;
            let value = c.u8()?;
            skip_value(c, value)
        }
        0x40..=0x45 => Ok(()),
        0x50..=0x56 => c.skip(1),
        0x60..=0x61 => c.skip(2),
        0x70..=0x74 => c.skip(4),
        0x80..=0x84 => c.skip(8),
        0x94 | 0x98 => c.skip(16),
        0xa0..=0xa3 | 0xc0 | 0xc1 | 0xe0 => {
            let len = c.u8()? as usize;
            c.skip(len)
        }
        0xb0..=0xb3 | 0xd0 | 0xd1 | 0xf0 => {
            let len = c.u32()? as usize;
            c.skip(len)
        }
        _ => Err(Truncated),
    }
}

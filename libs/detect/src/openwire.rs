//! OpenWire `WireFormatInfo` decoding.
//!
//! The first command an OpenWire client sends is a size-prefixed
//! `WireFormatInfo` carrying the `ActiveMQ` magic and a marshalled property
//! map. Clients that know they sit behind a gateway put the target virtual
//! host in the `Host` property; everything else routes to the default
//! virtual host. Nothing past this first command is readable before the
//! broker answers, so the decoder never waits for more.
//!
//! ```text
//! size u32 | type u8 (=1) | "ActiveMQ" | version u32 | present u8 | len u32 | map
//! ```

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol};
use crate::wire::{Cursor, Truncated};

/// Largest `WireFormatInfo` accepted.
pub const MAX_COMMAND_BYTES: usize = 64 * 1024;

const WIREFORMAT_INFO: u8 = 1;
const MAGIC: &[u8; 8] = b"ActiveMQ";
const HOST_PROPERTY: &str = "Host";

// Primitive map value types.
const NULL: u8 = 0;
const BOOLEAN_TYPE: u8 = 1;
const BYTE_TYPE: u8 = 2;
const CHAR_TYPE: u8 = 3;
const SHORT_TYPE: u8 = 4;
const INTEGER_TYPE: u8 = 5;
const LONG_TYPE: u8 = 6;
const DOUBLE_TYPE: u8 = 7;
const FLOAT_TYPE: u8 = 8;
const STRING_TYPE: u8 = 9;
const BYTE_ARRAY_TYPE: u8 = 10;
const MAP_TYPE: u8 = 11;
const LIST_TYPE: u8 = 12;
const BIG_STRING_TYPE: u8 = 13;

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenWireProtocol;

impl Protocol for OpenWireProtocol {
    fn name(&self) -> &'static str {
        "openwire"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["tcp", "openwire", "nio"]
    }

    fn max_identification_length(&self) -> usize {
        4 + 1 + MAGIC.len()
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        prefix.len() >= self.max_identification_length()
            && prefix[4] == WIREFORMAT_INFO
            && &prefix[5..13] == MAGIC
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(OpenWireDecoder::default())
    }
}

#[derive(Debug, Default)]
pub struct OpenWireDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder for OpenWireDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() < 4 {
            return Ok(Decoded::NeedMore);
        }
        let size = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if size > MAX_COMMAND_BYTES {
            return Err(DecodeError::FrameTooLarge {
                protocol: "openwire",
                size,
                limit: MAX_COMMAND_BYTES,
            });
        }
        if self.buffer.len() < 4 + size {
            return Ok(Decoded::NeedMore);
        }

        let host = parse_wire_format_info(&self.buffer[4..4 + size])?;
        Ok(Decoded::Complete(
            ConnectionParameters::new("tcp").with_virtual_host(host),
        ))
    }
}

fn parse_wire_format_info(command: &[u8]) -> Result<Option<String>, DecodeError> {
    let truncated = |_| DecodeError::malformed("openwire", "WireFormatInfo truncated");
    let mut c = Cursor::new(command);

    if c.u8().map_err(truncated)? != WIREFORMAT_INFO {
        return Err(DecodeError::malformed("openwire", "first command is not WireFormatInfo"));
    }
    if c.take(MAGIC.len()).map_err(truncated)? != MAGIC {
        return Err(DecodeError::malformed("openwire", "bad magic"));
    }
    let _version = c.u32().map_err(truncated)?;

    let has_properties = c.u8().map_err(truncated)? != 0;
    if !has_properties {
        return Ok(None);
    }
    let len = c.u32().map_err(truncated)? as usize;
    let map = c.take(len).map_err(truncated)?;

    find_string_property(map, HOST_PROPERTY)
        .map_err(|_| DecodeError::malformed("openwire", "property map truncated"))
}

/// Walk a marshalled primitive map looking for one string-valued key.
fn find_string_property(map: &[u8], wanted: &str) -> Result<Option<String>, Truncated> {
    let mut c = Cursor::new(map);
    let count = c.u32()? as i32;
    if count < 0 {
        return Ok(None);
    }

    for _ in 0..count {
        let key_len = c.u16()? as usize;
        let key = c.take(key_len)?;
        let value_type = c.u8()?;

        if key == wanted.as_bytes() && matches!(value_type, STRING_TYPE | BIG_STRING_TYPE) {
            let len = if value_type == STRING_TYPE {
                c.u16()? as usize
            } else {
                c.u32()? as usize
            };
            let value = c.take(len)?;
            return Ok(Some(String::from_utf8_lossy(value).into_owned()));
        }

        skip_primitive(&mut c, value_type)?;
    }

    Ok(None)
}

fn skip_primitive(c: &mut Cursor<'_>, value_type: u8) -> Result<(), Truncated> {
    match value_type {
        NULL => Ok(()),
        BOOLEAN_TYPE | BYTE_TYPE => c.skip(1),
        CHAR_TYPE | SHORT_TYPE => c.skip(2),
        INTEGER_TYPE | FLOAT_TYPE => c.skip(4),
        LONG_TYPE | DOUBLE_TYPE => c.skip(8),
        STRING_TYPE => {
            let len = c.u16()? as usize;
            c.skip(len)
        }
        BYTE_ARRAY_TYPE | BIG_STRING_TYPE => {
            let len = c.u32()? as usize;
            c.skip(len)
        }
        MAP_TYPE => {
            let count = c.u32()? as i32;
            for _ in 0..count.max(0) {
                let key_len = c.u16()? as usize;
                c.skip(key_len)?;
                let nested = c.u8()?;
                skip_primitive(c, nested)?;
            }
            Ok(())
        }
        LIST_TYPE => {
            let count = c.u32()? as i32;
            for _ in 0..count.max(0) {
                let nested = c.u8()?;
                skip_primitive(c, nested)?;
            }
            Ok(())
        }
        _ => Err(Truncated),
    }
}

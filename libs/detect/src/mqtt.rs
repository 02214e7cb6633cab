//! MQTT `CONNECT` packet decoding (3.1, 3.1.1 and 5.0).
//!
//! MQTT has no virtual host field, so the username carries one by
//! convention: `vhost/user`, split on the first `/`. A username without a
//! `/` names only the user; a `CONNECT` without a username cannot be routed.

use crate::error::DecodeError;
use crate::protocol::{ConnectionParameters, Decoded, FrameDecoder, Protocol, Rejection};
use crate::wire::{Cursor, Truncated};

/// Largest `CONNECT` packet accepted.
pub const MAX_CONNECT_BYTES: usize = 64 * 1024;

const PACKET_CONNECT: u8 = 0x10;
const PACKET_CONNACK: u8 = 0x20;

const FLAG_USERNAME: u8 = 0x80;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_WILL: u8 = 0x04;
const FLAG_RESERVED: u8 = 0x01;

const LEVEL_V5: u8 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct MqttProtocol;

impl Protocol for MqttProtocol {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn schemes(&self) -> &'static [&'static str] {
        &["mqtt", "mqtt+nio"]
    }

    fn max_identification_length(&self) -> usize {
        // fixed header byte + 4 length bytes + name length + "MQIsdp"
        1 + 4 + 2 + 6
    }

    fn matches(&self, prefix: &[u8]) -> bool {
        if prefix.first() != Some(&PACKET_CONNECT) {
            return false;
        }
        let Ok(Some((_, len_bytes))) = remaining_length(&prefix[1..]) else {
            return false;
        };
        let mut cursor = Cursor::new(&prefix[1 + len_bytes..]);
        let Ok(name_len) = cursor.u16() else {
            return false;
        };
        match cursor.take(name_len as usize) {
            Ok(name) => name == b"MQTT" || name == b"MQIsdp",
            Err(Truncated) => false,
        }
    }

    fn decoder(&self) -> Box<dyn FrameDecoder> {
        Box::new(MqttDecoder::default())
    }

    fn rejection(&self, params: &ConnectionParameters, rejection: &Rejection) -> Option<Vec<u8>> {
        let v5 = params.protocol_level == Some(LEVEL_V5);
        let packet = match (v5, rejection) {
            // reason 0x87 not authorized / 0x88 server unavailable, empty properties
            (true, Rejection::Policy { .. }) => vec![PACKET_CONNACK, 0x03, 0x00, 0x87, 0x00],
            (true, _) => vec![PACKET_CONNACK, 0x03, 0x00, 0x88, 0x00],
            // return code 5 not authorized / 3 server unavailable
            (false, Rejection::Policy { .. }) => vec![PACKET_CONNACK, 0x02, 0x00, 0x05],
            (false, _) => vec![PACKET_CONNACK, 0x02, 0x00, 0x03],
        };
        Some(packet)
    }
}

/// Decode an MQTT variable byte integer.
///
/// Returns `Ok(None)` if more bytes are needed, otherwise the value and the
/// number of bytes it occupied.
fn remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    for (i, byte) in buf.iter().enumerate().take(4) {
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(DecodeError::malformed("mqtt", "remaining length exceeds 4 bytes"));
    }
    Ok(None)
}

#[derive(Debug, Default)]
pub struct MqttDecoder {
    buffer: Vec<u8>,
    /// Total packet size once the fixed header has been read.
    packet_len: Option<usize>,
}

impl FrameDecoder for MqttDecoder {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError> {
        self.buffer.extend_from_slice(bytes);

        let packet_len = match self.packet_len {
            Some(len) => len,
            None => {
                let Some(&first) = self.buffer.first() else {
                    return Ok(Decoded::NeedMore);
                };
                if first != PACKET_CONNECT {
                    return Err(DecodeError::malformed(
                        "mqtt",
                        format!("first packet type {first:#04x} is not CONNECT"),
                    ));
                }
                let Some((remaining, len_bytes)) = remaining_length(&self.buffer[1..])? else {
                    return Ok(Decoded::NeedMore);
                };
                let total = 1 + len_bytes + remaining;
                if total > MAX_CONNECT_BYTES {
                    return Err(DecodeError::FrameTooLarge {
                        protocol: "mqtt",
                        size: total,
                        limit: MAX_CONNECT_BYTES,
                    });
                }
                self.packet_len = Some(total);
                total
            }
        };

        if self.buffer.len() < packet_len {
            return Ok(Decoded::NeedMore);
        }

        parse_connect(&self.buffer[..packet_len]).map(Decoded::Complete)
    }
}

fn parse_connect(packet: &[u8]) -> Result<ConnectionParameters, DecodeError> {
    let truncated = |_| DecodeError::malformed("mqtt", "CONNECT packet truncated");

    let Some((_, len_bytes)) = remaining_length(&packet[1..])? else {
        return Err(DecodeError::malformed("mqtt", "missing remaining length"));
    };
    let mut c = Cursor::new(&packet[1 + len_bytes..]);

    let name = string(&mut c).map_err(truncated)?;
    if name != "MQTT" && name != "MQIsdp" {
        return Err(DecodeError::malformed("mqtt", format!("unknown protocol name {name:?}")));
    }
    let level = c.u8().map_err(truncated)?;
    let flags = c.u8().map_err(truncated)?;
    if flags & FLAG_RESERVED != 0 {
        return Err(DecodeError::malformed("mqtt", "reserved connect flag is set"));
    }
    let _keep_alive = c.u16().map_err(truncated)?;

    if level == LEVEL_V5 {
        skip_properties(&mut c)?;
    }

    let _client_id = string(&mut c).map_err(truncated)?;

    if flags & FLAG_WILL != 0 {
        if level == LEVEL_V5 {
            skip_properties(&mut c)?;
        }
        let _will_topic = string(&mut c).map_err(truncated)?;
        let will_len = c.u16().map_err(truncated)?;
        c.skip(will_len as usize).map_err(truncated)?;
    }

    let username = if flags & FLAG_USERNAME != 0 {
        Some(string(&mut c).map_err(truncated)?)
    } else {
        None
    };

    if flags & FLAG_PASSWORD != 0 {
        let password_len = c.u16().map_err(truncated)?;
        c.skip(password_len as usize).map_err(truncated)?;
    }

    let Some(username) = username else {
        return Err(DecodeError::MissingRoutingKey {
            protocol: "mqtt",
            reason: "CONNECT has no username".to_string(),
        });
    };

    let (virtual_host, user) = match username.split_once('/') {
        Some((vhost, user)) => (Some(vhost.to_string()), Some(user.to_string())),
        None => (None, Some(username)),
    };

    Ok(ConnectionParameters {
        protocol_level: Some(level),
        ..ConnectionParameters::new("mqtt")
            .with_virtual_host(virtual_host)
            .with_user(user)
    })
}

fn string(c: &mut Cursor<'_>) -> Result<String, Truncated> {
    let len = c.u16()?;
    let raw = c.take(len as usize)?;
    Ok(String::from_utf8_lossy(raw).into_owned())
}

fn skip_properties(c: &mut Cursor<'_>) -> Result<(), DecodeError> {
    let Some((len, len_bytes)) = remaining_length(c.rest())? else {
        return Err(DecodeError::malformed("mqtt", "properties length truncated"));
    };
    c.skip(len_bytes + len)
        .map_err(|_| DecodeError::malformed("mqtt", "properties truncated"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Build a CONNECT packet.
    fn connect_packet(level: u8, username: Option<&str>, will: bool) -> Vec<u8> {
        let mut body = Vec::new();
        push_str(&mut body, if level == 3 { "MQIsdp" } else { "MQTT" });
        body.push(level);
        let mut flags = 0x02; // clean session
        if username.is_some() {
            flags |= FLAG_USERNAME | FLAG_PASSWORD;
        }
        if will {
            flags |= FLAG_WILL;
        }
        body.push(flags);
        body.extend_from_slice(&60u16.to_be_bytes());
        if level == LEVEL_V5 {
            // session expiry interval property
            body.extend_from_slice(&[0x05, 0x11, 0x00, 0x00, 0x00, 0x0a]);
        }
        push_str(&mut body, "client-1");
        if will {
            if level == LEVEL_V5 {
                body.push(0x00);
            }
            push_str(&mut body, "last/will");
            push_str(&mut body, "gone");
        }
        if let Some(user) = username {
            push_str(&mut body, user);
            push_str(&mut body, "secret");
        }

        let mut packet = vec![PACKET_CONNECT];
        let mut len = body.len();
        loop {
            let mut byte = (len % 128) as u8;
            len /= 128;
            if len > 0 {
                byte |= 0x80;
            }
            packet.push(byte);
            if len == 0 {
                break;
            }
        }
        packet.extend_from_slice(&body);
        packet
    }

    fn complete(packet: &[u8]) -> ConnectionParameters {
        match MqttDecoder::default().decode(packet).unwrap() {
            Decoded::Complete(params) => params,
            other => panic!("Expected Complete, got {:?}", other),
        }
    }

    #[test]
    fn test_username_carries_virtual_host() {
        let params = complete(&connect_packet(4, Some("broker0/alice"), false));
        assert_eq!(params.virtual_host.as_deref(), Some("broker0"));
        assert_eq!(params.user.as_deref(), Some("alice"));
        assert_eq!(params.protocol_level, Some(4));
    }

    #[test]
    fn test_split_on_first_slash_only() {
        let params = complete(&connect_packet(4, Some("vh/team/bob"), true));
        assert_eq!(params.virtual_host.as_deref(), Some("vh"));
        assert_eq!(params.user.as_deref(), Some("team/bob"));
    }

    #[test]
    fn test_v5_properties_skipped() {
        let params = complete(&connect_packet(5, Some("vh5/carol"), true));
        assert_eq!(params.virtual_host.as_deref(), Some("vh5"));
        assert_eq!(params.protocol_level, Some(5));
    }

    #[test]
    fn test_v31_protocol_name() {
        assert!(MqttProtocol.matches(&connect_packet(3, Some("a/b"), false)));
        let params = complete(&connect_packet(3, Some("a/b"), false));
        assert_eq!(params.virtual_host.as_deref(), Some("a"));
    }

    #[test]
    fn test_username_without_slash() {
        let params = complete(&connect_packet(4, Some("dave"), false));
        assert!(params.virtual_host.is_none());
        assert_eq!(params.user.as_deref(), Some("dave"));
    }

    #[test]
    fn test_missing_username_fails() {
        let err = MqttDecoder::default()
            .decode(&connect_packet(4, None, false))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingRoutingKey { .. }));
    }

    #[test]
    fn test_not_connect() {
        let err = MqttDecoder::default().decode(&[0x30, 0x00]).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
    }

    #[test]
    fn test_oversized_packet() {
        let err = MqttDecoder::default()
            .decode(&[PACKET_CONNECT, 0xff, 0xff, 0x7f])
            .unwrap_err();
        assert!(matches!(err, DecodeError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_connack_rejection() {
        let v4 = ConnectionParameters {
            protocol_level: Some(4),
            ..ConnectionParameters::new("mqtt")
        };
        assert_eq!(
            MqttProtocol.rejection(&v4, &Rejection::NoService),
            Some(vec![0x20, 0x02, 0x00, 0x03])
        );
        let v5 = ConnectionParameters {
            protocol_level: Some(5),
            ..ConnectionParameters::new("mqtt")
        };
        assert_eq!(
            MqttProtocol.rejection(&v5, &Rejection::Unavailable),
            Some(vec![0x20, 0x03, 0x00, 0x88, 0x00])
        );
    }
}

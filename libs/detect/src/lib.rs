//! Protocol detection for the protogate gateway.
//!
//! This library answers two questions about the first bytes of a TCP
//! connection, without doing any I/O itself:
//! - Which wire protocol is the client speaking? ([`ProtocolMatcher`])
//! - Which virtual host (and user) does its handshake name? ([`FrameDecoder`])
//!
//! Decoders are push-based: the caller feeds whatever bytes it read, in
//! chunks of any size, and the decoder reports [`Decoded::NeedMore`] until
//! the routing key is available.
//!
//! ## Supported protocols
//!
//! | Protocol | Signature | Routing key |
//! |---|---|---|
//! | TLS | record `0x16`, ClientHello | SNI host name |
//! | AMQP 1.0 | `AMQP` header | SASL init hostname / PLAIN user, or `Open` hostname |
//! | MQTT | `CONNECT` packet | username `vhost/user` |
//! | OpenWire | `WireFormatInfo` with `ActiveMQ` magic | `Host` wire format property |
//! | STOMP | `CONNECT` / `STOMP` frame | `host` header |
//! | HTTP/1.x | request method | `Host` header |

pub mod amqp;
mod error;
pub mod http;
mod matcher;
pub mod mqtt;
pub mod openwire;
mod protocol;
pub mod stomp;
pub mod tls;
mod wire;

pub use error::DecodeError;
pub use matcher::{MatchOutcome, ProtocolMatcher};
pub use protocol::{
    ConnectionParameters, Decoded, FrameDecoder, Protocol, Rejection, SharedProtocol,
};

use std::sync::Arc;

/// Look up a built-in protocol by name (`tls`, `amqp`, `mqtt`, `openwire`,
/// `stomp`, `http`).
pub fn builtin(name: &str) -> Option<SharedProtocol> {
    let protocol: SharedProtocol = match name.trim().to_ascii_lowercase().as_str() {
        "tls" | "ssl" => Arc::new(tls::TlsProtocol),
        "amqp" => Arc::new(amqp::AmqpProtocol),
        "mqtt" => Arc::new(mqtt::MqttProtocol),
        "openwire" => Arc::new(openwire::OpenWireProtocol),
        "stomp" => Arc::new(stomp::StompProtocol),
        "http" => Arc::new(http::HttpProtocol),
        _ => return None,
    };
    Some(protocol)
}

/// All built-in protocols in their default priority order.
///
/// Specific binary signatures come first; HTTP, whose signature is just a
/// request method, comes last.
pub fn default_protocols() -> Vec<SharedProtocol> {
    ["tls", "amqp", "mqtt", "openwire", "stomp", "http"]
        .iter()
        .filter_map(|name| builtin(name))
        .collect()
}

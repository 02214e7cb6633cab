//! Error types for handshake decoding.

use thiserror::Error;

/// Errors raised by a frame decoder.
///
/// Any of these means the bytes are inconsistent with the matched protocol;
/// the connection must be closed without contacting a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The handshake violates the protocol's framing rules.
    #[error("malformed {protocol} handshake: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },

    /// A frame declares (or grows to) a size beyond what the decoder accepts.
    #[error("{protocol} frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        protocol: &'static str,
        size: usize,
        limit: usize,
    },

    /// The handshake is well-formed but carries nothing to route on.
    #[error("{protocol} handshake carries no routing key: {reason}")]
    MissingRoutingKey {
        protocol: &'static str,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }
}

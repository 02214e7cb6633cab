//! Error types for connection sessions.

use std::io;
use std::time::Duration;

use protogate_detect::DecodeError;
use thiserror::Error;

/// Why a connection session ended without (or while) bridging.
///
/// Every variant is terminal for its session only; the accept loop logs it
/// and moves on.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered protocol matched within the identification window.
    #[error("unidentified_protocol: no protocol matched the first {prefix_len} bytes")]
    UnidentifiedProtocol { prefix_len: usize },

    /// The handshake is inconsistent with the matched protocol.
    #[error("decode_error: {0}")]
    Decode(#[from] DecodeError),

    /// The handshake grew past the prefix buffer bound.
    #[error("handshake_too_large: more than {limit} bytes before routing")]
    HandshakeTooLarge { limit: usize },

    /// Nothing in the registry advertises the routing key.
    #[error("no_candidates: no backend advertises {scheme}://{virtual_host}")]
    NoCandidates {
        scheme: String,
        virtual_host: String,
    },

    /// Every dial attempt failed.
    #[error("backend_unreachable: {attempts} attempt(s) failed")]
    BackendUnreachable {
        attempts: usize,
        #[source]
        last_error: Option<io::Error>,
    },

    /// Detection did not finish before the idle deadline.
    #[error("idle_timeout: handshake not resolved within {0:?}")]
    IdleTimeout(Duration),

    /// I/O failure while bridging.
    #[error("relay_error: {0}")]
    Relay(#[source] io::Error),

    /// The client hung up before a backend was chosen.
    #[error("client_closed: peer closed before routing")]
    ClientClosed,

    /// TLS termination failed.
    #[error("tls_error: {0}")]
    Tls(#[source] io::Error),

    /// An interception hook refused the request.
    #[error("rejected: {status} {message}")]
    Rejected { status: u16, message: String },

    /// Client socket I/O failure before bridging.
    #[error("io_error: {0}")]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::UnidentifiedProtocol { .. } => "unidentified_protocol",
            GatewayError::Decode(_) => "decode_error",
            GatewayError::HandshakeTooLarge { .. } => "handshake_too_large",
            GatewayError::NoCandidates { .. } => "no_candidates",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::IdleTimeout(_) => "idle_timeout",
            GatewayError::Relay(_) => "relay_error",
            GatewayError::ClientClosed => "client_closed",
            GatewayError::Tls(_) => "tls_error",
            GatewayError::Rejected { .. } => "rejected",
            GatewayError::Io(_) => "io_error",
        }
    }
}

//! Protocol descriptors and the decoder contract.

use std::fmt;
use std::sync::Arc;

use crate::error::DecodeError;
use crate::http::RequestHead;

/// A wire protocol the gateway can identify and route.
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Short lowercase name (`stomp`, `mqtt`, ...).
    fn name(&self) -> &'static str;

    /// URI schemes owned by this protocol. The first one is the scheme
    /// used to look up backends.
    fn schemes(&self) -> &'static [&'static str];

    /// Bytes needed to positively identify the protocol.
    fn max_identification_length(&self) -> usize;

    /// Does this prefix belong to the protocol?
    ///
    /// Called repeatedly as the prefix grows. Must return `false` while the
    /// prefix is too short to be sure.
    fn matches(&self, prefix: &[u8]) -> bool;

    /// Create a fresh decoder for one connection.
    fn decoder(&self) -> Box<dyn FrameDecoder>;

    /// Bytes to send the client before closing when routing fails.
    ///
    /// Protocols without an in-band way to refuse a connection return `None`
    /// and the connection is closed bare.
    fn rejection(&self, _params: &ConnectionParameters, _rejection: &Rejection) -> Option<Vec<u8>> {
        None
    }

    /// The scheme used for registry lookups.
    fn scheme(&self) -> &'static str {
        self.schemes().first().copied().unwrap_or_else(|| self.name())
    }
}

/// Shared protocol handle.
pub type SharedProtocol = Arc<dyn Protocol>;

/// Why a connection is being refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// No backend advertises the virtual host.
    NoService,
    /// Backends exist but none could be reached.
    Unavailable,
    /// A policy hook refused the request.
    Policy { status: u16, message: String },
}

/// Routing information extracted from a handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Scheme of the detected protocol.
    pub protocol: String,
    /// Virtual host named by the client, if any.
    pub virtual_host: Option<String>,
    /// User named by the client, if any.
    pub user: Option<String>,
    /// Decoded request head (HTTP only).
    pub request: Option<RequestHead>,
    /// Protocol revision, where the routing layer cares (MQTT level).
    pub protocol_level: Option<u8>,
}

impl ConnectionParameters {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            ..Self::default()
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: Option<String>) -> Self {
        self.virtual_host = virtual_host.filter(|v| !v.is_empty());
        self
    }

    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user.filter(|u| !u.is_empty());
        self
    }
}

/// Progress reported by a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Keep feeding bytes.
    NeedMore,
    /// The routing key is available.
    Complete(ConnectionParameters),
}

/// Incremental handshake decoder.
///
/// `decode` receives each newly read chunk exactly once. Chunks may split
/// frames at any byte; the result must not depend on how the stream was cut.
/// After `Complete` or an error the decoder must not be fed again.
pub trait FrameDecoder: Send {
    fn decode(&mut self, bytes: &[u8]) -> Result<Decoded, DecodeError>;
}

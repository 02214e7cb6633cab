//! Protocol matching over a growing prefix.

use tracing::trace;

use crate::protocol::SharedProtocol;

/// Result of matching a prefix.
#[derive(Debug, Clone)]
pub enum MatchOutcome {
    /// No protocol matched yet, but more bytes could change that.
    NoMatchYet,
    /// First protocol (in registration order) that accepted the prefix.
    Matched(SharedProtocol),
    /// The prefix is long enough for every protocol and none matched.
    NoneMatched,
}

/// Ordered set of protocols tried against each connection.
#[derive(Debug, Clone)]
pub struct ProtocolMatcher {
    protocols: Vec<SharedProtocol>,
    max_identification_length: usize,
}

impl ProtocolMatcher {
    /// Create a matcher. Protocols are tried in the given order.
    pub fn new(protocols: Vec<SharedProtocol>) -> Self {
        let max_identification_length = protocols
            .iter()
            .map(|p| p.max_identification_length())
            .max()
            .unwrap_or(0);

        Self {
            protocols,
            max_identification_length,
        }
    }

    /// Longest identification window of any registered protocol.
    pub fn max_identification_length(&self) -> usize {
        self.max_identification_length
    }

    /// Match the prefix collected so far.
    pub fn detect(&self, prefix: &[u8]) -> MatchOutcome {
        if let Some(protocol) = self.protocols.iter().find(|p| p.matches(prefix)) {
            trace!(protocol = protocol.name(), prefix_len = prefix.len(), "protocol matched");
            return MatchOutcome::Matched(protocol.clone());
        }

        if prefix.len() >= self.max_identification_length {
            MatchOutcome::NoneMatched
        } else {
            MatchOutcome::NoMatchYet
        }
    }
}

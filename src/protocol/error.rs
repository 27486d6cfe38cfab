//! Protocol error types

use std::fmt;

/// Violations of the MQTT v3.1.1 session contract.
///
/// Any of these tears the connection down; the packet that caused it has no
/// partial effect on broker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic name contains wildcards or is otherwise malformed
    InvalidTopic(&'static str),
    /// Topic filter is malformed
    InvalidTopicFilter(&'static str),
    /// Packet not legal in the current session state
    UnexpectedPacket(&'static str),
    /// Client identifier rejected (empty with clean_session=false)
    ClientIdRejected,
    /// Generic protocol violation
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::InvalidTopicFilter(msg) => write!(f, "invalid topic filter: {}", msg),
            Self::UnexpectedPacket(msg) => write!(f, "unexpected packet: {}", msg),
            Self::ClientIdRejected => write!(f, "client identifier rejected"),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

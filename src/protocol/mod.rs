//! MQTT Protocol definitions and types
//!
//! Core MQTT v3.1.1 types shared by the broker engine and the transport seam.

mod error;
mod packet;

pub use error::ProtocolError;
pub use packet::*;

/// Topic namespace reserved for broker-internal traffic.
///
/// Topics under this prefix never match `+` or `#` placed at the first
/// level; clients must subscribe to them explicitly.
pub const SYS_PREFIX: &str = "$SYS/";

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// Returns the minimum of two QoS levels (for subscription matching)
    pub fn min(self, other: Self) -> Self {
        if (self as u8) < (other as u8) {
            self
        } else {
            other
        }
    }
}

//! Data models crossing the persistence seam.
//!
//! These carry runtime types (`Arc<str>` topics, `Bytes` payloads) so the
//! bundled memory store keeps the hot path allocation-free; durable
//! backends apply their own encoding behind the trait.

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{Publish, QoS};

/// A subscription as stored for a persistent session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSubscription {
    /// Topic filter
    pub filter: String,
    /// Granted QoS
    pub qos: QoS,
}

/// A retained message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedMessage {
    /// The publish delivered to a subscriber whose new filter covers this
    /// topic. The retain flag stays set on retained deliveries.
    pub fn to_publish(&self, qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            retain: true,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

impl From<&Publish> for RetainedMessage {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
        }
    }
}

/// A stored will, tagged with the broker holding the session.
///
/// The owning broker id is what lets surviving brokers recognize wills
/// orphaned by a dead peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRecord {
    pub client_id: Arc<str>,
    pub broker_id: Arc<str>,
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl WillRecord {
    pub fn to_publish(&self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
        }
    }
}

//! QoS delivery engine
//!
//! Inflight delivery records and the stage machine behind QoS 1 and QoS 2.
//! A record is created when a QoS > 0 publish enters a handshake and dropped
//! when the handshake completes; for persistent sessions every stage
//! transition is written to storage before the packet that advances the
//! handshake is handed to the transport, so a reconnect resumes from the
//! last stage the peer could have observed.

use crate::protocol::{Packet, Publish, PubRel, QoS};

/// Which half of a handshake a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Broker to client (broker is the sender)
    Outbound,
    /// Client to broker (broker is the receiver)
    Inbound,
}

/// Durable position inside a delivery handshake.
///
/// Outbound records move `Sent` -> (`Released`) -> gone; inbound QoS 2
/// records hold `Received` until the PUBREL arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStage {
    /// PUBLISH handed to the transport, awaiting PUBACK (QoS 1) or PUBREC
    /// (QoS 2)
    Sent,
    /// PUBREC seen, PUBREL handed to the transport, awaiting PUBCOMP
    Released,
    /// Inbound QoS 2 PUBLISH accepted and forwarded, awaiting PUBREL
    Received,
}

/// One in-progress delivery
#[derive(Debug, Clone)]
pub struct Inflight {
    pub direction: Direction,
    pub packet_id: u16,
    pub qos: QoS,
    pub stage: DeliveryStage,
    pub publish: Publish,
}

impl Inflight {
    /// Record for a QoS > 0 publish the broker is about to send
    pub fn outbound(packet_id: u16, publish: Publish) -> Self {
        Self {
            direction: Direction::Outbound,
            packet_id,
            qos: publish.qos,
            stage: DeliveryStage::Sent,
            publish,
        }
    }

    /// Record for a QoS 2 publish received from a client
    pub fn inbound(packet_id: u16, publish: Publish) -> Self {
        Self {
            direction: Direction::Inbound,
            packet_id,
            qos: publish.qos,
            stage: DeliveryStage::Received,
            publish,
        }
    }

    /// Packet that resumes this handshake after a reconnect.
    ///
    /// A record already past `Sent` must not replay the PUBLISH: the peer
    /// has acknowledged receipt, so only the PUBREL goes out again. Inbound
    /// records resume silently and wait for the client.
    pub fn resume_packet(&self) -> Option<Packet> {
        match (self.direction, self.stage) {
            (Direction::Outbound, DeliveryStage::Sent) => {
                let mut publish = self.publish.clone();
                publish.dup = true;
                publish.packet_id = Some(self.packet_id);
                Some(Packet::Publish(publish))
            }
            (Direction::Outbound, DeliveryStage::Released) => {
                Some(Packet::PubRel(PubRel::new(self.packet_id)))
            }
            _ => None,
        }
    }
}

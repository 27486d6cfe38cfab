//! QoS acknowledgment handling (PUBACK, PUBREC, PUBREL, PUBCOMP).
//!
//! Every transition of a persistent session's handshake is written to
//! storage before the packet that advances it goes out. An acknowledgment
//! for a packet id with no open handshake is a protocol violation and tears
//! the session down.

use super::{Client, SessionError};
use crate::protocol::{Packet, ProtocolError, PubAck, PubComp, PubRec, PubRel};
use crate::qos::{DeliveryStage, Direction};

impl Client {
    /// PUBACK: a QoS 1 delivery to this client is complete
    pub(super) async fn handle_puback(&self, ack: PubAck) -> Result<(), SessionError> {
        let (client_id, clean, known) = {
            let mut session = self.session.lock();
            let known = session
                .inflight_remove(Direction::Outbound, ack.packet_id)
                .is_some();
            (session.client_id.clone(), session.clean, known)
        };
        if !known {
            return Err(ProtocolError::ProtocolViolation("PUBACK for unknown packet id").into());
        }
        if !clean {
            self.broker
                .persistence
                .inflight_remove(&client_id, Direction::Outbound, ack.packet_id)
                .await?;
        }
        Ok(())
    }

    /// PUBREC: first acknowledgment of a QoS 2 delivery to this client.
    /// The released stage reaches storage before PUBREL goes out.
    pub(super) async fn handle_pubrec(&self, ack: PubRec) -> Result<(), SessionError> {
        let (client_id, clean, known) = {
            let mut session = self.session.lock();
            let known = match session.inflight_get_mut(Direction::Outbound, ack.packet_id) {
                Some(record) => {
                    record.stage = DeliveryStage::Released;
                    true
                }
                None => false,
            };
            (session.client_id.clone(), session.clean, known)
        };
        if !known {
            return Err(ProtocolError::ProtocolViolation("PUBREC for unknown packet id").into());
        }
        if !clean {
            // A missing durable record here means the handshake could not
            // survive a restart; fail the session rather than limp on
            self.broker
                .persistence
                .inflight_update(&client_id, Direction::Outbound, ack.packet_id, DeliveryStage::Released)
                .await?;
        }
        self.send(Packet::PubRel(PubRel::new(ack.packet_id)))
    }

    /// PUBREL: the publisher settled an inbound QoS 2 handshake.
    /// The record is spent before PUBCOMP goes out.
    pub(super) async fn handle_pubrel(&self, ack: PubRel) -> Result<(), SessionError> {
        let (client_id, clean, known) = {
            let mut session = self.session.lock();
            let known = session
                .inflight_remove(Direction::Inbound, ack.packet_id)
                .is_some();
            (session.client_id.clone(), session.clean, known)
        };
        if !known {
            return Err(ProtocolError::ProtocolViolation("PUBREL for unknown packet id").into());
        }
        if !clean {
            self.broker
                .persistence
                .inflight_remove(&client_id, Direction::Inbound, ack.packet_id)
                .await?;
        }
        self.send(Packet::PubComp(PubComp::new(ack.packet_id)))
    }

    /// PUBCOMP: a QoS 2 delivery to this client is complete
    pub(super) async fn handle_pubcomp(&self, ack: PubComp) -> Result<(), SessionError> {
        let (client_id, clean, known) = {
            let mut session = self.session.lock();
            let known = session
                .inflight_remove(Direction::Outbound, ack.packet_id)
                .is_some();
            (session.client_id.clone(), session.clean, known)
        };
        if !known {
            return Err(ProtocolError::ProtocolViolation("PUBCOMP for unknown packet id").into());
        }
        if !clean {
            self.broker
                .persistence
                .inflight_remove(&client_id, Direction::Outbound, ack.packet_id)
                .await?;
        }
        Ok(())
    }
}

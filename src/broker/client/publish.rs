//! Inbound PUBLISH handling.
//!
//! QoS 0 is fire and forget. QoS 1 forwards, then acknowledges. QoS 2
//! records the packet id before PUBREC goes out, so a redelivered PUBLISH is
//! re-acknowledged without being forwarded twice; for a persistent session
//! the record reaches storage first.

use tracing::debug;

use super::{Client, SessionError};
use crate::broker::BrokerEvent;
use crate::protocol::{Packet, ProtocolError, PubAck, PubRec, Publish, QoS};
use crate::qos::{Direction, Inflight};
use crate::topic::validate_topic_name;

impl Client {
    pub(super) async fn handle_publish(&self, publish: Publish) -> Result<(), SessionError> {
        validate_topic_name(&publish.topic)?;

        match publish.qos {
            QoS::AtMostOnce => {
                if self.authorize_inbound(&publish).await? {
                    self.broker.route(publish).await?;
                }
                Ok(())
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.ok_or(ProtocolError::ProtocolViolation(
                    "QoS 1 PUBLISH without packet id",
                ))?;
                // Forward before acknowledging: PUBACK promises the message
                // made it into the broker
                if self.authorize_inbound(&publish).await? {
                    self.broker.route(publish).await?;
                }
                self.send(Packet::PubAck(PubAck::new(packet_id)))
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.ok_or(ProtocolError::ProtocolViolation(
                    "QoS 2 PUBLISH without packet id",
                ))?;

                // A handshake already under way: re-acknowledge, do not
                // forward again
                if self
                    .session
                    .lock()
                    .inflight_contains(Direction::Inbound, packet_id)
                {
                    return self.send(Packet::PubRec(PubRec::new(packet_id)));
                }

                let allowed = self.authorize_inbound(&publish).await?;

                let (client_id, clean, record) = {
                    let mut session = self.session.lock();
                    let record = Inflight::inbound(packet_id, publish.clone());
                    session.inflight_insert(record.clone());
                    (session.client_id.clone(), session.clean, record)
                };
                if !clean {
                    self.broker
                        .persistence
                        .inflight_store(&client_id, &record)
                        .await?;
                }

                if allowed {
                    self.broker.route(publish).await?;
                }
                self.send(Packet::PubRec(PubRec::new(packet_id)))
            }
        }
    }

    /// Run the publish authorization hook. A deny drops the message but the
    /// handshake still completes normally.
    async fn authorize_inbound(&self, publish: &Publish) -> Result<bool, SessionError> {
        match self.broker.hooks.authorize_publish(Some(self), publish).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                let client_id = self.client_id();
                debug!("client {} publish to {} denied", client_id, publish.topic);
                self.broker.emit(BrokerEvent::ClientError {
                    client_id,
                    message: format!("publish to {} denied", publish.topic),
                });
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

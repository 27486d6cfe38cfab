//! SUBSCRIBE and UNSUBSCRIBE handling.
//!
//! Filters are validated up front in both directions: a malformed filter
//! anywhere in the packet fails the whole command before anything is
//! applied. Authorization runs per filter and may rewrite a grant; a denied
//! filter gets the failure code while the rest proceed.

use bytes::Bytes;
use serde_json::json;
use tracing::debug;

use super::{Client, SessionError};
use crate::broker::BrokerEvent;
use crate::persistence::StoredSubscription;
use crate::protocol::{
    Packet, ProtocolError, SubAck, SubAckCode, Subscribe, Subscription, UnsubAck, Unsubscribe,
};
use crate::topic::{validate_topic_filter, ClientSubscription};

impl Client {
    pub(super) async fn handle_subscribe(&self, subscribe: Subscribe) -> Result<(), SessionError> {
        if subscribe.subscriptions.is_empty() {
            return Err(
                ProtocolError::ProtocolViolation("SUBSCRIBE with no topic filters").into(),
            );
        }
        for requested in &subscribe.subscriptions {
            validate_topic_filter(&requested.filter)?;
        }

        let (client_id, clean) = {
            let session = self.session.lock();
            (session.client_id.clone(), session.clean)
        };

        // Authorize each filter; the hook may rewrite a grant
        let mut codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted: Vec<Subscription> = Vec::with_capacity(subscribe.subscriptions.len());
        for requested in &subscribe.subscriptions {
            match self.broker.hooks.authorize_subscribe(self, requested).await {
                Ok(Some(grant)) => {
                    validate_topic_filter(&grant.filter)?;
                    codes.push(SubAckCode::granted(grant.qos));
                    granted.push(grant);
                }
                Ok(None) => {
                    debug!(
                        "client {} subscription to {} denied",
                        client_id, requested.filter
                    );
                    codes.push(SubAckCode::Failure);
                }
                Err(err) => return Err(err.into()),
            }
        }

        // A persistent session must not acknowledge grants it could forget:
        // storage first, then SUBACK
        if !clean && !granted.is_empty() {
            let stored: Vec<StoredSubscription> = granted
                .iter()
                .map(|grant| StoredSubscription {
                    filter: grant.filter.clone(),
                    qos: grant.qos,
                })
                .collect();
            self.broker
                .persistence
                .add_subscriptions(&client_id, &stored)
                .await?;
        }

        for grant in &granted {
            self.broker.matcher.subscribe(
                &grant.filter,
                ClientSubscription {
                    client_id: client_id.clone(),
                    qos: grant.qos,
                },
            );
        }

        self.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            codes,
        }))?;

        // Retained catch-up comes after the acknowledgment
        for grant in &granted {
            self.deliver_retained(grant).await?;
        }

        if !granted.is_empty() {
            let filters: Vec<String> = granted.iter().map(|g| g.filter.clone()).collect();
            self.broker.emit(BrokerEvent::Subscribe {
                client_id: client_id.clone(),
                filters,
            });
            let body = json!({
                "clientId": client_id.as_ref(),
                "subs": granted
                    .iter()
                    .map(|g| json!({ "topic": g.filter, "qos": g.qos as u8 }))
                    .collect::<Vec<_>>(),
            });
            self.broker
                .sys_publish("new/subscribes", Bytes::from(body.to_string()))
                .await;
        }
        Ok(())
    }

    /// Send the retained messages matching a fresh grant, capped at its QoS
    async fn deliver_retained(&self, grant: &Subscription) -> Result<(), SessionError> {
        let retained = self
            .broker
            .persistence
            .retained_matching(&grant.filter)
            .await?;
        for message in retained {
            let qos = message.qos.min(grant.qos);
            self.deliver(message.to_publish(qos)).await?;
        }
        Ok(())
    }

    pub(super) async fn handle_unsubscribe(
        &self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), SessionError> {
        // Every filter is checked before any is applied
        for filter in &unsubscribe.filters {
            validate_topic_filter(filter)?;
        }

        let (client_id, clean) = {
            let session = self.session.lock();
            (session.client_id.clone(), session.clean)
        };

        // Storage first, so an acknowledged unsubscribe cannot come back on
        // resume. Internal cleanup calls carry no packet id and skip storage.
        if !clean && unsubscribe.packet_id.is_some() && !unsubscribe.filters.is_empty() {
            self.broker
                .persistence
                .remove_subscriptions(&client_id, &unsubscribe.filters)
                .await?;
        }

        for filter in &unsubscribe.filters {
            self.broker.matcher.unsubscribe(filter, &client_id);
        }

        if let Some(packet_id) = unsubscribe.packet_id {
            self.send(Packet::UnsubAck(UnsubAck { packet_id }))?;
        }

        if !unsubscribe.filters.is_empty() {
            self.broker.emit(BrokerEvent::Unsubscribe {
                client_id: client_id.clone(),
                filters: unsubscribe.filters.clone(),
            });
            let body = json!({
                "clientId": client_id.as_ref(),
                "subs": unsubscribe.filters,
            });
            self.broker
                .sys_publish("new/unsubscribes", Bytes::from(body.to_string()))
                .await;
        }
        Ok(())
    }
}

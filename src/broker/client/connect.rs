//! CONNECT handling: authentication, session takeover, persistent session
//! resumption and will registration.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use super::{Client, SessionError};
use crate::broker::BrokerEvent;
use crate::hooks::HookError;
use crate::persistence::WillRecord;
use crate::protocol::{ConnAck, Connect, ConnectCode, Packet, ProtocolError};
use crate::topic::{validate_topic_name, ClientSubscription};

impl Client {
    pub(super) async fn handle_connect(self: &Arc<Self>, connect: Connect) -> Result<(), SessionError> {
        let Connect {
            client_id,
            clean_session,
            keep_alive,
            username,
            password,
            will,
        } = connect;

        // A will topic follows publish topic rules: no wildcards
        if let Some(will) = &will {
            validate_topic_name(&will.topic)?;
        }

        // [MQTT-3.1.3-7] an empty client id is only allowed with a clean session
        let client_id: Arc<str> = if client_id.is_empty() {
            if !clean_session {
                self.send(Packet::ConnAck(ConnAck::refused(
                    ConnectCode::IdentifierRejected,
                )))?;
                return Err(ProtocolError::ClientIdRejected.into());
            }
            generated_client_id()
        } else {
            Arc::from(client_id.as_str())
        };

        match self
            .broker
            .hooks
            .authenticate(&client_id, username.as_deref(), password.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("client {} rejected: bad credentials", client_id);
                self.send(Packet::ConnAck(ConnAck::refused(
                    ConnectCode::BadCredentials,
                )))?;
                return Err(HookError::AuthenticationFailed.into());
            }
            Err(err) => {
                self.send(Packet::ConnAck(ConnAck::refused(
                    ConnectCode::ServerUnavailable,
                )))?;
                return Err(err.into());
            }
        }

        // A second session for the same identity evicts the first
        if let Some(existing) = self
            .broker
            .clients
            .get(&client_id)
            .map(|e| e.value().clone())
        {
            info!("client {} connected twice, closing previous session", client_id);
            existing.close_evicted().await;
        }

        // Discard or load persistent state
        let mut session_present = false;
        let mut stored_subs = Vec::new();
        let mut stored_inflight = Vec::new();
        if clean_session {
            self.broker.persistence.clear_client(&client_id).await?;
        } else {
            stored_subs = self.broker.persistence.subscriptions(&client_id).await?;
            stored_inflight = self.broker.persistence.inflight(&client_id).await?;
            session_present = !stored_subs.is_empty() || !stored_inflight.is_empty();
        }

        // Finalization is atomic with respect to concurrent closes: once a
        // close has run, the session must not come up after it
        {
            let mut closed = self.closed.lock().await;
            if *closed || self.broker.closing.load(Ordering::SeqCst) {
                return Err(SessionError::Closed);
            }

            // The will record reaches storage before the session is admitted,
            // so a sibling broker can take it over from the first moment. It
            // also precedes establish: a storage failure here aborts a
            // session that never came up, leaving no will to fire.
            let record = will.as_ref().map(|will| WillRecord {
                client_id: client_id.clone(),
                broker_id: self.broker.id.clone(),
                topic: Arc::from(will.topic.as_str()),
                payload: will.payload.clone(),
                qos: will.qos,
                retain: will.retain,
            });
            if let Some(record) = &record {
                self.broker.persistence.put_will(record.clone()).await?;
            }

            {
                let mut session = self.session.lock();
                session.establish(client_id.clone(), clean_session, keep_alive);
                session.will = will.clone();
            }

            self.broker.pending.remove(&self.handle);
            if let Some(displaced) = self.broker.clients.insert(client_id.clone(), self.clone()) {
                if !Arc::ptr_eq(&displaced, self) {
                    displaced.close_evicted().await;
                    // A finalize racing this one may have rewritten the
                    // record between our store and the insert; ours is
                    // authoritative for the identity now
                    let reassert = match record {
                        Some(record) => self.broker.persistence.put_will(record).await,
                        None => self
                            .broker
                            .persistence
                            .del_will(&client_id)
                            .await
                            .map(|_| ()),
                    };
                    if let Err(err) = reassert {
                        self.broker.report_error("storing will", &err);
                    }
                }
            }
        }

        self.send(Packet::ConnAck(ConnAck::accepted(session_present)))?;

        // Resume a persistent session: re-register its subscriptions and
        // replay open handshakes from their durable stages
        if session_present {
            for stored in &stored_subs {
                self.broker.matcher.subscribe(
                    &stored.filter,
                    ClientSubscription {
                        client_id: client_id.clone(),
                        qos: stored.qos,
                    },
                );
            }
            {
                let mut session = self.session.lock();
                session.restore_inflight(stored_inflight.iter().cloned());
            }
            for record in &stored_inflight {
                if let Some(packet) = record.resume_packet() {
                    self.send(packet)?;
                }
            }
        }

        info!(
            "client {} connected (clean={}, keep_alive={}s, session_present={})",
            client_id, clean_session, keep_alive, session_present
        );
        self.broker.emit(BrokerEvent::ClientConnected {
            client_id: client_id.clone(),
        });
        self.broker
            .sys_publish("new/clients", Bytes::copy_from_slice(client_id.as_bytes()))
            .await;
        Ok(())
    }
}

/// Identifier handed to clients that connect with an empty one
fn generated_client_id() -> Arc<str> {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    Arc::from(format!("culex-{:016x}", hasher.finish()).as_str())
}

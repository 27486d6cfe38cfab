//! Client connection handle.
//!
//! One `Client` exists per attached transport connection. The transport
//! feeds decoded packets into [`Client::handle`] in arrival order and drains
//! outbound packets from the receiver returned by
//! [`Broker::attach`](super::Broker::attach). An error from `handle` means
//! the session is over and the socket should be dropped; teardown, will
//! handling included, has already run by the time the error comes back.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::hooks::HookError;
use crate::persistence::PersistenceError;
use crate::protocol::{Packet, ProtocolError, Publish, QoS};
use crate::qos::{Direction, Inflight};
use crate::session::{Phase, Session};

use super::{will, Broker, BrokerEvent};

/// Why a client operation failed or a session ended
#[derive(Debug)]
pub enum SessionError {
    /// MQTT protocol violation
    Protocol(ProtocolError),
    /// Authentication or authorization machinery failed
    Hook(HookError),
    /// The persistence backend failed
    Persistence(PersistenceError),
    /// The client went quiet past its keep-alive window
    KeepaliveTimeout,
    /// The client ended the session with DISCONNECT
    Disconnected,
    /// The session is already closed
    Closed,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Protocol(e) => write!(f, "protocol error: {}", e),
            SessionError::Hook(e) => write!(f, "hook error: {}", e),
            SessionError::Persistence(e) => write!(f, "persistence error: {}", e),
            SessionError::KeepaliveTimeout => write!(f, "keep alive timed out"),
            SessionError::Disconnected => write!(f, "client disconnected"),
            SessionError::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Protocol(e) => Some(e),
            SessionError::Hook(e) => Some(e),
            SessionError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<HookError> for SessionError {
    fn from(e: HookError) -> Self {
        SessionError::Hook(e)
    }
}

impl From<PersistenceError> for SessionError {
    fn from(e: PersistenceError) -> Self {
        SessionError::Persistence(e)
    }
}

/// Handle for one attached connection
pub struct Client {
    pub(super) broker: Arc<Broker>,
    /// Attachment id, used to track the connection before CONNECT names it
    handle: u64,
    pub(super) session: Mutex<Session>,
    /// Outbound packet queue; `None` once the session is over
    tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    /// Serializes teardown; `true` once it has fully run
    closed: tokio::sync::Mutex<bool>,
    /// Wakes the watchdog so it can exit early on close
    halt: Notify,
}

impl Client {
    pub(super) fn new(broker: Arc<Broker>, handle: u64, tx: mpsc::UnboundedSender<Packet>) -> Arc<Self> {
        let connect_timeout = broker.options.connect_timeout;
        Arc::new(Self {
            broker,
            handle,
            session: Mutex::new(Session::new(connect_timeout)),
            tx: Mutex::new(Some(tx)),
            closed: tokio::sync::Mutex::new(false),
            halt: Notify::new(),
        })
    }

    /// Client identifier; empty until CONNECT completes
    pub fn client_id(&self) -> Arc<str> {
        self.session.lock().client_id.clone()
    }

    /// Whether the CONNECT handshake has completed and the session is live
    pub fn is_connected(&self) -> bool {
        self.session.lock().is_connected()
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.session.lock().is_closed()
    }

    /// Process one inbound packet.
    ///
    /// Packets must arrive in wire order, one call at a time. An `Err` means
    /// the session is over and the socket should be dropped;
    /// [`SessionError::Disconnected`] is the graceful variant after a
    /// DISCONNECT packet. Teardown has already run when an error is
    /// returned.
    pub async fn handle(self: &Arc<Self>, packet: Packet) -> Result<(), SessionError> {
        {
            let mut session = self.session.lock();
            if session.is_closed() {
                return Err(SessionError::Closed);
            }
            session.touch();
        }

        let result = self.dispatch(packet).await;
        if let Err(err) = &result {
            match err {
                SessionError::Disconnected | SessionError::Closed => {}
                _ => {
                    let client_id = self.client_id();
                    warn!("client {} failed: {}", client_id, err);
                    self.broker.emit(BrokerEvent::ClientError {
                        client_id,
                        message: err.to_string(),
                    });
                    self.close_with(true).await;
                }
            }
        }
        result
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) -> Result<(), SessionError> {
        let phase = self.session.lock().phase();
        match phase {
            Phase::Closed => Err(SessionError::Closed),
            Phase::Connecting => match packet {
                Packet::Connect(connect) => self.handle_connect(*connect).await,
                other => Err(ProtocolError::UnexpectedPacket(other.name()).into()),
            },
            Phase::Connected => match packet {
                Packet::Connect(_) => {
                    Err(ProtocolError::ProtocolViolation("duplicate CONNECT").into())
                }
                Packet::Publish(publish) => self.handle_publish(publish).await,
                Packet::PubAck(ack) => self.handle_puback(ack).await,
                Packet::PubRec(ack) => self.handle_pubrec(ack).await,
                Packet::PubRel(ack) => self.handle_pubrel(ack).await,
                Packet::PubComp(ack) => self.handle_pubcomp(ack).await,
                Packet::Subscribe(subscribe) => self.handle_subscribe(subscribe).await,
                Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(unsubscribe).await,
                Packet::PingReq => self.send(Packet::PingResp),
                Packet::Disconnect => self.handle_disconnect().await,
                other => Err(ProtocolError::UnexpectedPacket(other.name()).into()),
            },
        }
    }

    /// Queue a packet for the transport
    pub(super) fn send(&self, packet: Packet) -> Result<(), SessionError> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) if tx.send(packet).is_ok() => Ok(()),
            _ => Err(SessionError::Closed),
        }
    }

    /// Deliver a publish to this client as a subscriber.
    ///
    /// Allocates the packet id and records the handshake for QoS > 0; for a
    /// persistent session the record reaches storage before the packet is
    /// handed to the transport.
    pub(super) async fn deliver(&self, mut publish: Publish) -> Result<(), SessionError> {
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
            return self.send(Packet::Publish(publish));
        }

        let (client_id, clean, record) = {
            let mut session = self.session.lock();
            if !session.is_connected() {
                return Err(SessionError::Closed);
            }
            let packet_id = session.next_packet_id();
            publish.packet_id = Some(packet_id);
            let record = Inflight::outbound(packet_id, publish.clone());
            session.inflight_insert(record.clone());
            (session.client_id.clone(), session.clean, record)
        };

        if !clean {
            if let Err(err) = self
                .broker
                .persistence
                .inflight_store(&client_id, &record)
                .await
            {
                self.session
                    .lock()
                    .inflight_remove(Direction::Outbound, record.packet_id);
                return Err(err.into());
            }
        }

        self.send(Packet::Publish(publish))
    }

    /// Close from the transport side: the socket died or is being dropped.
    ///
    /// The will, if any, is evaluated; concurrent closes wait for the first
    /// one and the will is never evaluated twice.
    pub async fn close(&self) {
        self.close_with(true).await;
    }

    /// Close the previous session of a reconnecting identity. Its will is
    /// discarded unless a close was already under way.
    pub(super) async fn close_evicted(&self) {
        self.close_with(false).await;
    }

    /// Mark a connection attached to an already closing broker as dead
    pub(super) fn decommission(&self) {
        self.session.lock().close();
        *self.tx.lock() = None;
    }

    async fn close_with(&self, deliver_will: bool) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }

        let (client_id, clean, was_connected, will) = {
            let mut session = self.session.lock();
            let snapshot = (
                session.client_id.clone(),
                session.clean,
                session.is_connected(),
                session.will.take(),
            );
            session.close();
            snapshot
        };
        self.halt.notify_waiters();
        *self.tx.lock() = None;
        self.broker.pending.remove(&self.handle);

        if !was_connected {
            // Never finished CONNECT: nothing registered, nothing stored
            *closed = true;
            return;
        }

        // Claim the identity before touching anything keyed by it. A session
        // displaced by a newer connection for the same id no longer owns the
        // will record, the stored session or the matcher entries; only the
        // current occupant of the clients map may tear those down.
        let owns_identity = self
            .broker
            .clients
            .remove_if(&client_id, |_, registered| {
                std::ptr::eq(Arc::as_ptr(registered), self)
            })
            .is_some();

        if owns_identity {
            if deliver_will {
                if let Some(will) = will {
                    will::evaluate(&self.broker, &client_id, will).await;
                }
            } else if will.is_some() {
                // Suppressed: the stored record is spent without publishing
                if let Err(err) = self.broker.persistence.del_will(&client_id).await {
                    self.broker.report_error("deleting will", &err);
                }
            }

            // Live subscriptions end with the connection; the persisted set
            // survives for a persistent session
            self.broker.matcher.unsubscribe_all(&client_id);
            if clean {
                if let Err(err) = self.broker.persistence.clear_client(&client_id).await {
                    self.broker.report_error("clearing session", &err);
                }
            }
        }

        info!("client {} disconnected", client_id);
        self.broker
            .emit(BrokerEvent::ClientDisconnected { client_id });
        *closed = true;
    }

    /// Watch the connect and keep-alive deadlines.
    ///
    /// The deadline only ever moves forward, so waking at a stale one and
    /// re-reading is enough; `halt` just lets the task exit promptly when the
    /// session closes.
    pub(super) fn spawn_watchdog(self: &Arc<Self>) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let session = client.session.lock();
                    if session.is_closed() {
                        return;
                    }
                    session.watchdog_deadline()
                };
                let Some(deadline) = deadline else { return };

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        let (phase, expired) = {
                            let session = client.session.lock();
                            let expired = session
                                .watchdog_deadline()
                                .is_some_and(|d| d <= Instant::now());
                            (session.phase(), expired)
                        };
                        match phase {
                            Phase::Closed => return,
                            _ if !expired => continue,
                            Phase::Connecting => {
                                debug!("connection sent no CONNECT within the window");
                                client.close_with(true).await;
                                return;
                            }
                            Phase::Connected => {
                                let client_id = client.client_id();
                                info!("client {} keep alive timed out", client_id);
                                client.broker.emit(BrokerEvent::KeepaliveTimeout {
                                    client_id: client_id.clone(),
                                });
                                client.broker.emit(BrokerEvent::ClientError {
                                    client_id,
                                    message: SessionError::KeepaliveTimeout.to_string(),
                                });
                                client.close_with(true).await;
                                return;
                            }
                        }
                    }
                    _ = client.halt.notified() => return,
                }
            }
        });
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.lock();
        f.debug_struct("Client")
            .field("client_id", &session.client_id)
            .field("phase", &session.phase())
            .finish()
    }
}

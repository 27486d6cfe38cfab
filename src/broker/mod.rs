//! Broker Engine Core
//!
//! The coordinator that ties sessions, subscriptions, persistence and hooks
//! together:
//! - Connection attachment and the per-packet client loop (see [`Client`])
//! - Fan-out with per-subscriber QoS capping and duplicate elimination
//! - Retained message handling through the persistence backend
//! - Heartbeats and will takeover for dead sibling brokers sharing a backend
//! - `$SYS` notification topics and a broadcast event channel

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{MemoryPersistence, Persistence, RetainedMessage};
use crate::protocol::{Packet, ProtocolError, Publish, QoS, SYS_PREFIX};
use crate::topic::{validate_topic_filter, validate_topic_name, Matcher, ObserverFn, ObserverToken};

mod client;
mod heartbeat;
mod will;

pub use client::{Client, SessionError};

/// Broker engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Broker identity used in `$SYS` topics and shared will records.
    /// Generated from the host name when not set.
    pub broker_id: Option<String>,
    /// Interval between heartbeat ticks (e.g., "60s", "1m").
    /// Zero disables heartbeats and will takeover.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// How long an attached connection may wait before its CONNECT (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Capacity of the broadcast event channel
    pub event_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            broker_id: None,
            heartbeat_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

/// Events broadcast by the broker engine
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    /// A client completed its CONNECT handshake
    ClientConnected { client_id: Arc<str> },
    /// A client session ended. Emitted only after any will handling for the
    /// session has resolved.
    ClientDisconnected { client_id: Arc<str> },
    /// A client operation failed without tearing the whole broker down
    ClientError { client_id: Arc<str>, message: String },
    /// A client was granted subscriptions
    Subscribe { client_id: Arc<str>, filters: Vec<String> },
    /// A client dropped subscriptions
    Unsubscribe { client_id: Arc<str>, filters: Vec<String> },
    /// A message went through the fan-out path
    Publish { topic: Arc<str>, qos: QoS },
    /// A connected client missed its keep-alive window
    KeepaliveTimeout { client_id: Arc<str> },
    /// A persistence or takeover failure not tied to a single client.
    /// The message keeps the underlying failure text.
    BrokerError { message: String },
}

/// The broker engine.
///
/// Transport-agnostic: callers [`attach`](Broker::attach) a connection handle
/// per client, feed decoded packets into [`Client::handle`] and drain outbound
/// packets from the returned receiver. Several brokers may share one
/// persistence backend; heartbeats let the survivors deliver the wills of a
/// sibling that died.
pub struct Broker {
    options: BrokerOptions,
    id: Arc<str>,
    /// Connected clients by client identifier
    clients: DashMap<Arc<str>, Arc<Client>>,
    /// Attached connections that have not completed CONNECT yet
    pending: DashMap<u64, Arc<Client>>,
    next_handle: AtomicU64,
    matcher: Matcher,
    persistence: Arc<dyn Persistence>,
    hooks: Arc<dyn Hooks>,
    events: broadcast::Sender<BrokerEvent>,
    shutdown: broadcast::Sender<()>,
    /// Sibling brokers by id, with the instant their last heartbeat arrived
    peers: DashMap<Arc<str>, Instant>,
    /// Brokers gone quiet: when their silence started
    silent_since: DashMap<Arc<str>, Instant>,
    started_at: Instant,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    closing: AtomicBool,
    closed: tokio::sync::Mutex<bool>,
}

impl Broker {
    /// Create a broker with in-memory persistence and permit-all hooks.
    ///
    /// Must be called inside a Tokio runtime: the heartbeat task is spawned
    /// here.
    pub fn new(options: BrokerOptions) -> Arc<Self> {
        Self::with_parts(options, Arc::new(MemoryPersistence::new()), Arc::new(DefaultHooks))
    }

    /// Create a broker with an explicit persistence backend and hook set.
    ///
    /// Must be called inside a Tokio runtime: the heartbeat task is spawned
    /// here.
    pub fn with_parts(
        options: BrokerOptions,
        persistence: Arc<dyn Persistence>,
        hooks: Arc<dyn Hooks>,
    ) -> Arc<Self> {
        let id: Arc<str> = match &options.broker_id {
            Some(id) => Arc::from(id.as_str()),
            None => generate_broker_id(),
        };
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        let (shutdown, _) = broadcast::channel(1);

        let broker = Arc::new(Self {
            options,
            id,
            clients: DashMap::new(),
            pending: DashMap::new(),
            next_handle: AtomicU64::new(0),
            matcher: Matcher::new(),
            persistence,
            hooks,
            events,
            shutdown,
            peers: DashMap::new(),
            silent_since: DashMap::new(),
            started_at: Instant::now(),
            heartbeat: Mutex::new(None),
            closing: AtomicBool::new(false),
            closed: tokio::sync::Mutex::new(false),
        });

        heartbeat::spawn(&broker);
        info!("broker {} started", broker.id);
        broker
    }

    /// Broker identifier, as used in `$SYS` topics and will records
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of clients with an established session
    pub fn connected_clients(&self) -> usize {
        self.clients.len()
    }

    /// Subscribe to the broker event stream
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Attach a new connection.
    ///
    /// Returns the client handle the transport feeds inbound packets into and
    /// the receiver it drains outbound packets from. The receiver yielding
    /// `None` means the session is over and the socket should be closed. The
    /// connection has [`BrokerOptions::connect_timeout`] to send its CONNECT.
    pub fn attach(self: &Arc<Self>) -> (Arc<Client>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(self.clone(), handle, tx);

        if self.closing.load(Ordering::SeqCst) {
            client.decommission();
            return (client, rx);
        }

        self.pending.insert(handle, client.clone());
        client.spawn_watchdog();
        (client, rx)
    }

    /// Publish a message as the broker itself.
    ///
    /// Bypasses the publish authorization hook; transports deliver client
    /// publishes through [`Client::handle`] instead.
    pub async fn publish(&self, publish: Publish) -> Result<(), SessionError> {
        validate_topic_name(&publish.topic)?;
        self.route(publish).await?;
        Ok(())
    }

    /// Register an in-process observer for a topic filter.
    ///
    /// The handler runs inline on the fan-out path for every matching
    /// publish. Keep it cheap and non-blocking.
    pub fn observe(
        &self,
        filter: &str,
        handler: Arc<ObserverFn>,
    ) -> Result<ObserverToken, ProtocolError> {
        validate_topic_filter(filter)?;
        Ok(self.matcher.observe(filter, handler))
    }

    /// Remove a previously registered observer
    pub fn unobserve(&self, token: &ObserverToken) {
        self.matcher.unobserve(token);
    }

    /// Shut the broker down.
    ///
    /// Stops the heartbeat, closes every session (delivering wills, as for
    /// any other ungraceful close) and closes the persistence backend.
    /// Waits for in-flight persistence and hook calls: each client close
    /// completes its own teardown before this returns. Idempotent.
    pub async fn close(&self) {
        let mut closed = self.closed.lock().await;
        if *closed {
            return;
        }
        self.closing.store(true, Ordering::SeqCst);

        let _ = self.shutdown.send(());
        let heartbeat = self.heartbeat.lock().take();
        if let Some(task) = heartbeat {
            let _ = task.await;
        }

        // Connections that never finished CONNECT carry no will
        let pending: Vec<Arc<Client>> = self.pending.iter().map(|e| e.value().clone()).collect();
        for client in pending {
            client.close().await;
        }

        let clients: Vec<Arc<Client>> = self.clients.iter().map(|e| e.value().clone()).collect();
        for client in clients {
            client.close().await;
        }

        if let Err(err) = self.persistence.close().await {
            self.report_error("closing persistence", &err);
        }

        *closed = true;
        info!("broker {} closed", self.id);
    }

    /// Fan a publish out to matching subscribers and observers.
    ///
    /// Stores the retained copy first when the retain flag is set; a
    /// persistence failure there aborts delivery. Each subscribing client
    /// receives at most one copy, capped at the strongest QoS it was granted
    /// across all matching filters. Delivery failures for one subscriber do
    /// not affect the rest.
    async fn route(&self, publish: Publish) -> crate::persistence::Result<()> {
        if publish.retain {
            self.persistence
                .store_retained(RetainedMessage::from(&publish))
                .await?;
        }

        let matched = self.matcher.matching(&publish.topic);

        let mut grants: AHashMap<Arc<str>, QoS> = AHashMap::new();
        for sub in &matched.clients {
            let grant = grants.entry(sub.client_id.clone()).or_insert(QoS::AtMostOnce);
            if sub.qos > *grant {
                *grant = sub.qos;
            }
        }

        for (client_id, grant) in grants {
            let client = match self.clients.get(&client_id) {
                Some(entry) => entry.value().clone(),
                None => continue,
            };
            let mut copy = publish.clone();
            copy.qos = publish.qos.min(grant);
            copy.retain = false;
            copy.dup = false;
            copy.packet_id = None;
            if let Err(err) = client.deliver(copy).await {
                match err {
                    SessionError::Closed | SessionError::Disconnected => {}
                    other => self.report_client_error(&client_id, &other),
                }
            }
        }

        for observer in &matched.observers {
            observer(&publish);
        }

        self.emit(BrokerEvent::Publish {
            topic: publish.topic.clone(),
            qos: publish.qos,
        });
        Ok(())
    }

    /// Publish under this broker's `$SYS` subtree, best effort
    async fn sys_publish(&self, suffix: &str, payload: Bytes) {
        let topic: Arc<str> = format!("{}{}/{}", SYS_PREFIX, self.id, suffix).into();
        let publish = Publish {
            topic,
            payload,
            ..Publish::default()
        };
        if let Err(err) = self.route(publish).await {
            debug!("$SYS publish failed: {}", err);
        }
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.events.send(event);
    }

    fn report_client_error(&self, client_id: &Arc<str>, err: &SessionError) {
        warn!("client {} error: {}", client_id, err);
        self.emit(BrokerEvent::ClientError {
            client_id: client_id.clone(),
            message: err.to_string(),
        });
    }

    fn report_error(&self, context: &str, err: &dyn std::fmt::Display) {
        error!("{}: {}", context, err);
        self.emit(BrokerEvent::BrokerError {
            message: err.to_string(),
        });
    }
}

/// Host name plus a random suffix, unique enough for sibling brokers
/// sharing a persistence backend
fn generate_broker_id() -> Arc<str> {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "culex".to_string());
    let suffix = RandomState::new().build_hasher().finish() & 0xFFFF_FFFF;
    Arc::from(format!("{}-{:08x}", host, suffix).as_str())
}

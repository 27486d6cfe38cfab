//! Will delivery tests
//!
//! The will lifecycle end to end: registration on CONNECT, suppression on
//! graceful DISCONNECT, exactly-once delivery on ungraceful close, orphan
//! takeover from a dead sibling broker sharing the persistence backend, and
//! the persistence failure paths that must surface on the error channel.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;

use culex::broker::{Broker, BrokerEvent, BrokerOptions, Client, SessionError};
use culex::hooks::{DefaultHooks, HookError, HookResult, Hooks};
use culex::persistence::{
    MemoryPersistence, Persistence, PersistenceError, RetainedMessage, Result as PersistenceResult,
    StoredSubscription, WillRecord,
};
use culex::protocol::{Connect, ConnectCode, Packet, Publish, QoS, Will};
use culex::qos::{DeliveryStage, Direction, Inflight};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn options(heartbeat: Duration) -> BrokerOptions {
    BrokerOptions {
        broker_id: Some("test-broker".to_string()),
        heartbeat_interval: heartbeat,
        connect_timeout: Duration::from_secs(5),
        event_capacity: 256,
    }
}

fn broker_with(
    heartbeat: Duration,
    persistence: Arc<dyn Persistence>,
    hooks: Arc<dyn Hooks>,
) -> Arc<Broker> {
    init_logging();
    Broker::with_parts(options(heartbeat), persistence, hooks)
}

fn last_will() -> Will {
    Will {
        topic: "mywill".to_string(),
        payload: Bytes::from_static(b"last will"),
        qos: QoS::AtMostOnce,
        retain: false,
    }
}

fn will_connect(client_id: &str) -> Connect {
    Connect {
        client_id: client_id.to_string(),
        clean_session: true,
        will: Some(last_will()),
        ..Default::default()
    }
}

fn orphan_will(client_id: &str, broker_id: &str) -> WillRecord {
    WillRecord {
        client_id: Arc::from(client_id),
        broker_id: Arc::from(broker_id),
        topic: Arc::from("mywill"),
        payload: Bytes::from_static(b"last will"),
        qos: QoS::AtMostOnce,
        retain: false,
    }
}

/// One attached connection driven directly through the engine API
struct TestConn {
    client: Arc<Client>,
    rx: UnboundedReceiver<Packet>,
}

impl TestConn {
    async fn connect(broker: &Arc<Broker>, connect: Connect) -> Self {
        let (client, rx) = broker.attach();
        let mut conn = Self { client, rx };
        conn.client
            .handle(Packet::Connect(Box::new(connect)))
            .await
            .expect("connect failed");
        match conn.recv().await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectCode::Accepted),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        conn
    }

    async fn recv(&mut self) -> Packet {
        timeout(RECV_TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed")
    }
}

/// Capture every publish matching a filter through a broker observer
fn watch(broker: &Arc<Broker>, filter: &str) -> UnboundedReceiver<Publish> {
    let (tx, rx) = mpsc::unbounded_channel();
    broker
        .observe(
            filter,
            Arc::new(move |publish| {
                let _ = tx.send(publish.clone());
            }),
        )
        .expect("valid filter");
    rx
}

async fn expect_publish(rx: &mut UnboundedReceiver<Publish>) -> Publish {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a publish")
        .expect("observer dropped")
}

async fn expect_silence(rx: &mut UnboundedReceiver<Publish>, window: Duration) {
    if let Ok(Some(publish)) = timeout(window, rx.recv()).await {
        panic!("unexpected publish on {}", publish.topic);
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<BrokerEvent>, mut pred: F) -> BrokerEvent
where
    F: FnMut(&BrokerEvent) -> bool,
{
    loop {
        let event = timeout(RECV_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

// ============================================================================
// Test hooks
// ============================================================================

/// Records whether the publish authorization saw a live client
struct RecordingHooks {
    saw_client: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn authorize_publish(
        &self,
        client: Option<&Client>,
        _publish: &Publish,
    ) -> HookResult<bool> {
        *self.saw_client.lock() = Some(client.is_some());
        Ok(true)
    }
}

/// Denies every publish authorization outright, counting the calls
#[derive(Default)]
struct RefuseHooks {
    calls: AtomicUsize,
}

#[async_trait]
impl Hooks for RefuseHooks {
    async fn authorize_publish(
        &self,
        _client: Option<&Client>,
        _publish: &Publish,
    ) -> HookResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
}

/// Fails every publish authorization with a hook error
struct ErrorHooks;

#[async_trait]
impl Hooks for ErrorHooks {
    async fn authorize_publish(
        &self,
        _client: Option<&Client>,
        _publish: &Publish,
    ) -> HookResult<bool> {
        Err(HookError::AuthorizationDenied)
    }
}

/// Takes a while before approving a publish
struct SlowWillHooks {
    delay: Duration,
}

#[async_trait]
impl Hooks for SlowWillHooks {
    async fn authorize_publish(
        &self,
        _client: Option<&Client>,
        _publish: &Publish,
    ) -> HookResult<bool> {
        tokio::time::sleep(self.delay).await;
        Ok(true)
    }
}

/// Takes a while before accepting credentials
struct SlowAuthHooks {
    delay: Duration,
}

#[async_trait]
impl Hooks for SlowAuthHooks {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        tokio::time::sleep(self.delay).await;
        Ok(true)
    }
}

/// Fails authentication with an internal error
struct BrokenAuthHooks;

#[async_trait]
impl Hooks for BrokenAuthHooks {
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Err(HookError::Internal("auth backend offline".to_string()))
    }
}

// ============================================================================
// Failure-injecting persistence
// ============================================================================

/// Memory persistence with switchable failures and delays on the
/// will-critical operations, to drive the error and interleaving paths
/// deterministically.
struct FailingPersistence {
    inner: MemoryPersistence,
    fail_put_will: AtomicBool,
    fail_del_will: AtomicBool,
    fail_store_retained: AtomicBool,
    clear_delay: Mutex<Option<Duration>>,
}

impl FailingPersistence {
    fn new() -> Self {
        Self {
            inner: MemoryPersistence::new(),
            fail_put_will: AtomicBool::new(false),
            fail_del_will: AtomicBool::new(false),
            fail_store_retained: AtomicBool::new(false),
            clear_delay: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Persistence for FailingPersistence {
    async fn add_subscriptions(
        &self,
        client_id: &str,
        subs: &[StoredSubscription],
    ) -> PersistenceResult<()> {
        self.inner.add_subscriptions(client_id, subs).await
    }

    async fn remove_subscriptions(
        &self,
        client_id: &str,
        filters: &[String],
    ) -> PersistenceResult<()> {
        self.inner.remove_subscriptions(client_id, filters).await
    }

    async fn subscriptions(&self, client_id: &str) -> PersistenceResult<Vec<StoredSubscription>> {
        self.inner.subscriptions(client_id).await
    }

    async fn store_retained(&self, message: RetainedMessage) -> PersistenceResult<()> {
        if self.fail_store_retained.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("Throws error".to_string()));
        }
        self.inner.store_retained(message).await
    }

    async fn retained_matching(&self, filter: &str) -> PersistenceResult<Vec<RetainedMessage>> {
        self.inner.retained_matching(filter).await
    }

    async fn put_will(&self, will: WillRecord) -> PersistenceResult<()> {
        if self.fail_put_will.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("Throws error".to_string()));
        }
        self.inner.put_will(will).await
    }

    async fn get_will(&self, client_id: &str) -> PersistenceResult<Option<WillRecord>> {
        self.inner.get_will(client_id).await
    }

    async fn del_will(&self, client_id: &str) -> PersistenceResult<Option<WillRecord>> {
        if self.fail_del_will.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("Throws error".to_string()));
        }
        self.inner.del_will(client_id).await
    }

    async fn wills(&self) -> PersistenceResult<Vec<WillRecord>> {
        self.inner.wills().await
    }

    async fn inflight_store(&self, client_id: &str, record: &Inflight) -> PersistenceResult<()> {
        self.inner.inflight_store(client_id, record).await
    }

    async fn inflight_update(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
        stage: DeliveryStage,
    ) -> PersistenceResult<()> {
        self.inner
            .inflight_update(client_id, direction, packet_id, stage)
            .await
    }

    async fn inflight_remove(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
    ) -> PersistenceResult<()> {
        self.inner
            .inflight_remove(client_id, direction, packet_id)
            .await
    }

    async fn inflight(&self, client_id: &str) -> PersistenceResult<Vec<Inflight>> {
        self.inner.inflight(client_id).await
    }

    async fn clear_client(&self, client_id: &str) -> PersistenceResult<()> {
        let delay = *self.clear_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.clear_client(client_id).await
    }

    async fn close(&self) -> PersistenceResult<()> {
        self.inner.close().await
    }
}

// ============================================================================
// Will lifecycle
// ============================================================================

#[tokio::test]
async fn test_delivers_a_will() {
    let broker = broker_with(
        Duration::ZERO,
        Arc::new(MemoryPersistence::new()),
        Arc::new(DefaultHooks),
    );
    let mut will_rx = watch(&broker, "mywill");

    let conn = TestConn::connect(&broker, will_connect("c1")).await;
    conn.client.close().await;

    let publish = expect_publish(&mut will_rx).await;
    assert_eq!(publish.topic.as_ref(), "mywill");
    assert_eq!(publish.payload.as_ref(), b"last will");
    assert_eq!(publish.qos, QoS::AtMostOnce);
    assert!(!publish.retain);

    broker.close().await;
}

#[tokio::test]
async fn test_will_reaches_subscribers() {
    let broker = broker_with(
        Duration::ZERO,
        Arc::new(MemoryPersistence::new()),
        Arc::new(DefaultHooks),
    );

    let mut listener = TestConn::connect(
        &broker,
        Connect {
            client_id: "listener".to_string(),
            ..Default::default()
        },
    )
    .await;
    listener
        .client
        .handle(Packet::Subscribe(culex::protocol::Subscribe {
            packet_id: 1,
            subscriptions: vec![culex::protocol::Subscription {
                filter: "mywill".to_string(),
                qos: QoS::AtMostOnce,
            }],
        }))
        .await
        .expect("subscribe");
    match listener.recv().await {
        Packet::SubAck(_) => {}
        other => panic!("expected SUBACK, got {:?}", other),
    }

    let dying = TestConn::connect(&broker, will_connect("dying")).await;
    dying.client.close().await;

    match listener.recv().await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic.as_ref(), "mywill");
            assert_eq!(publish.payload.as_ref(), b"last will");
        }
        other => panic!("expected the will publish, got {:?}", other),
    }
    broker.close().await;
}

#[tokio::test]
async fn test_two_closes_deliver_one_will() {
    let broker = broker_with(
        Duration::ZERO,
        Arc::new(MemoryPersistence::new()),
        Arc::new(DefaultHooks),
    );
    let mut will_rx = watch(&broker, "mywill");

    let conn = TestConn::connect(&broker, will_connect("c1")).await;
    tokio::join!(conn.client.close(), conn.client.close());

    let publish = expect_publish(&mut will_rx).await;
    assert_eq!(publish.topic.as_ref(), "mywill");
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;

    broker.close().await;
}

#[tokio::test]
async fn test_will_stored_in_persistence_on_connect() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));

    let _conn = TestConn::connect(&broker, will_connect("abcde")).await;

    let record = store.get_will("abcde").await.unwrap().expect("will record");
    assert_eq!(record.broker_id.as_ref(), broker.id());
    assert_eq!(record.topic.as_ref(), "mywill");
    assert_eq!(record.payload.as_ref(), b"last will");
    assert_eq!(record.qos, QoS::AtMostOnce);
    assert!(!record.retain);

    broker.close().await;
}

#[tokio::test]
async fn test_will_record_deleted_after_delivery() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let conn = TestConn::connect(&broker, will_connect("abcde")).await;
    conn.client.close().await;

    expect_publish(&mut will_rx).await;
    // the disconnect notification marks the end of all will handling
    wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::ClientDisconnected { .. })
    })
    .await;
    assert!(store.get_will("abcde").await.unwrap().is_none());
    broker.close().await;
}

#[tokio::test]
async fn test_disconnect_suppresses_will() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let conn = TestConn::connect(&broker, will_connect("abcde")).await;
    assert!(store.get_will("abcde").await.unwrap().is_some());

    let err = conn
        .client
        .handle(Packet::Disconnect)
        .await
        .expect_err("disconnect ends the session");
    assert!(matches!(err, SessionError::Disconnected));

    wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::ClientDisconnected { .. })
    })
    .await;
    assert!(store.get_will("abcde").await.unwrap().is_none());
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    broker.close().await;
}

#[tokio::test]
async fn test_reconnect_keeps_single_will_record() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));

    let conn = TestConn::connect(&broker, will_connect("abcde")).await;
    let _ = conn.client.handle(Packet::Disconnect).await;

    let _conn = TestConn::connect(&broker, will_connect("abcde")).await;

    let record = store.del_will("abcde").await.unwrap();
    assert!(record.is_some(), "one will record for the client");
    assert!(
        store.del_will("abcde").await.unwrap().is_none(),
        "and only one"
    );
    broker.close().await;
}

#[tokio::test]
async fn test_takeover_suppresses_previous_will() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");

    let mut first = TestConn::connect(&broker, will_connect("c1")).await;
    // second CONNECT under the same identity evicts the first session
    let _second = TestConn::connect(&broker, will_connect("c1")).await;

    let leftover = timeout(RECV_TIMEOUT, first.rx.recv())
        .await
        .expect("evicted connection should close");
    assert!(leftover.is_none(), "evicted connection is closed");
    assert!(first.client.is_closed());

    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    // the stored record now belongs to the new session
    assert!(store.get_will("c1").await.unwrap().is_some());
    broker.close().await;
}

#[tokio::test]
async fn test_concurrent_connects_keep_survivor_will_record() {
    let store = Arc::new(FailingPersistence::new());
    *store.clear_delay.lock() = Some(Duration::from_millis(60));
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");

    // two CONNECTs for one identity in flight at once, held open inside the
    // storage layer so both pass the takeover check before either is admitted
    let (first, mut first_rx) = broker.attach();
    let (second, mut second_rx) = broker.attach();
    let mut late = will_connect("c1");
    late.will = Some(Will {
        payload: Bytes::from_static(b"survivor"),
        ..last_will()
    });

    let first_task = {
        let first = first.clone();
        tokio::spawn(async move {
            first
                .handle(Packet::Connect(Box::new(will_connect("c1"))))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second_task = {
        let second = second.clone();
        tokio::spawn(async move { second.handle(Packet::Connect(Box::new(late))).await })
    };

    first_task.await.expect("task").expect("first connect");
    second_task.await.expect("task").expect("second connect");

    // the earlier session was admitted, then displaced by the later one
    match timeout(RECV_TIMEOUT, first_rx.recv()).await.expect("packet") {
        Some(Packet::ConnAck(ack)) => assert_eq!(ack.code, ConnectCode::Accepted),
        other => panic!("expected CONNACK, got {:?}", other),
    }
    let leftover = timeout(RECV_TIMEOUT, first_rx.recv())
        .await
        .expect("displaced connection should close");
    assert!(leftover.is_none(), "displaced connection is closed");
    match timeout(RECV_TIMEOUT, second_rx.recv()).await.expect("packet") {
        Some(Packet::ConnAck(ack)) => assert_eq!(ack.code, ConnectCode::Accepted),
        other => panic!("expected CONNACK, got {:?}", other),
    }

    // the displaced teardown must not touch the survivor's state
    assert_eq!(broker.connected_clients(), 1);
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    let record = store
        .get_will("c1")
        .await
        .unwrap()
        .expect("the live session keeps its will record");
    assert_eq!(record.payload.as_ref(), b"survivor");
    broker.close().await;
}

// ============================================================================
// Authorization
// ============================================================================

#[tokio::test]
async fn test_disconnect_event_waits_for_will_authorization() {
    let hooks = Arc::new(SlowWillHooks {
        delay: Duration::from_millis(50),
    });
    let broker = broker_with(Duration::ZERO, Arc::new(MemoryPersistence::new()), hooks);
    let mut events = broker.events();

    let conn = TestConn::connect(&broker, will_connect("c1")).await;
    conn.client.close().await;

    let mut saw_will = false;
    loop {
        let event = wait_for(&mut events, |e| {
            matches!(
                e,
                BrokerEvent::Publish { .. } | BrokerEvent::ClientDisconnected { .. }
            )
        })
        .await;
        match event {
            BrokerEvent::Publish { topic, .. } if topic.as_ref() == "mywill" => saw_will = true,
            BrokerEvent::ClientDisconnected { client_id } => {
                assert_eq!(client_id.as_ref(), "c1");
                break;
            }
            _ => {}
        }
    }
    assert!(
        saw_will,
        "will publish must precede the disconnect notification"
    );
    broker.close().await;
}

#[tokio::test]
async fn test_denied_will_never_published() {
    let store = Arc::new(MemoryPersistence::new());
    let hooks = Arc::new(RefuseHooks::default());
    let broker = broker_with(Duration::ZERO, store.clone(), hooks.clone());
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let conn = TestConn::connect(&broker, will_connect("c1")).await;
    conn.client.close().await;

    wait_for(&mut events, |e| {
        matches!(e, BrokerEvent::ClientDisconnected { .. })
    })
    .await;
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    // the deny is final: asked exactly once, record spent
    assert_eq!(hooks.calls.load(Ordering::SeqCst), 1);
    assert!(store.get_will("c1").await.unwrap().is_none());
    broker.close().await;
}

#[tokio::test]
async fn test_no_will_when_authentication_errors() {
    let store = Arc::new(MemoryPersistence::new());
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(BrokenAuthHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let (client, mut rx) = broker.attach();
    let err = client
        .handle(Packet::Connect(Box::new(will_connect("c1"))))
        .await
        .expect_err("authentication must fail");
    assert!(matches!(err, SessionError::Hook(_)));

    match timeout(RECV_TIMEOUT, rx.recv()).await.expect("connack") {
        Some(Packet::ConnAck(ack)) => assert_eq!(ack.code, ConnectCode::ServerUnavailable),
        other => panic!("expected refusing CONNACK, got {:?}", other),
    }
    wait_for(&mut events, |e| matches!(e, BrokerEvent::ClientError { .. })).await;

    assert!(store.get_will("c1").await.unwrap().is_none());
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    broker.close().await;
}

#[tokio::test]
async fn test_broker_close_during_authentication_suppresses_will() {
    let store = Arc::new(MemoryPersistence::new());
    let hooks = Arc::new(SlowAuthHooks {
        delay: Duration::from_millis(100),
    });
    let broker = broker_with(Duration::ZERO, store.clone(), hooks);
    let mut will_rx = watch(&broker, "mywill");

    let (client, _rx) = broker.attach();
    let mut connect = will_connect("c1");
    connect.keep_alive = 1;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.handle(Packet::Connect(Box::new(connect))).await })
    };

    // close while authenticate is still deciding
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.close().await;

    let result = pending.await.expect("connect task");
    assert!(result.is_err(), "connect must not succeed after close");
    // the session never came up, so no keepalive timer can fire later
    assert_eq!(broker.connected_clients(), 0);
    assert!(store.get_will("c1").await.unwrap().is_none());
    expect_silence(&mut will_rx, Duration::from_millis(200)).await;
}

// ============================================================================
// Orphan takeover
// ============================================================================

#[tokio::test]
async fn test_orphan_will_delivered_after_three_missed_heartbeats() {
    let store = Arc::new(MemoryPersistence::new());
    store
        .put_will(orphan_will("myClientId42", "anotherBroker"))
        .await
        .unwrap();

    let saw_client = Arc::new(Mutex::new(None));
    let hooks = Arc::new(RecordingHooks {
        saw_client: saw_client.clone(),
    });

    let interval = Duration::from_millis(25);
    let started = Instant::now();
    let broker = broker_with(interval, store.clone(), hooks);
    let mut will_rx = watch(&broker, "mywill");

    let publish = expect_publish(&mut will_rx).await;
    assert!(
        started.elapsed() >= interval * 3,
        "the will needs a full staleness window"
    );
    assert_eq!(publish.topic.as_ref(), "mywill");
    assert_eq!(publish.payload.as_ref(), b"last will");
    assert_eq!(
        *saw_client.lock(),
        Some(false),
        "orphan authorization must see no live client"
    );

    // exactly once, and the record is spent
    expect_silence(&mut will_rx, interval * 5).await;
    assert!(store.wills().await.unwrap().is_empty());

    broker.close().await;
}

#[tokio::test]
async fn test_orphan_will_requires_authorization() {
    let store = Arc::new(MemoryPersistence::new());
    store
        .put_will(orphan_will("myClientId42", "anotherBroker"))
        .await
        .unwrap();

    let broker = broker_with(Duration::from_millis(25), store.clone(), Arc::new(ErrorHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    // the rejection surfaces as a broker error and nothing is published
    wait_for(&mut events, |e| matches!(e, BrokerEvent::BrokerError { .. })).await;
    expect_silence(&mut will_rx, Duration::from_millis(150)).await;
    assert!(store.wills().await.unwrap().is_empty());
    broker.close().await;
}

#[tokio::test]
async fn test_no_takeover_while_owner_heartbeats() {
    let store = Arc::new(MemoryPersistence::new());
    store
        .put_will(orphan_will("myClientId42", "broker1"))
        .await
        .unwrap();

    let interval = Duration::from_millis(25);
    let broker = broker_with(interval, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");

    // keep the owner alive with fake heartbeats across several windows
    for _ in 0..10 {
        broker
            .publish(Publish {
                topic: Arc::from("$SYS/broker1/heartbeat"),
                payload: Bytes::from_static(b"broker1"),
                ..Publish::default()
            })
            .await
            .expect("heartbeat publish");
        expect_silence(&mut will_rx, Duration::from_millis(20)).await;
    }
    assert_eq!(store.wills().await.unwrap().len(), 1, "will still pending");

    // silence the owner: the will is orphaned and taken over
    let publish = expect_publish(&mut will_rx).await;
    assert_eq!(publish.topic.as_ref(), "mywill");
    broker.close().await;
}

// ============================================================================
// Error channel
// ============================================================================

#[tokio::test]
async fn test_will_delete_failure_surfaces_on_error_channel() {
    let store = Arc::new(FailingPersistence::new());
    store
        .inner
        .put_will(orphan_will("myClientId42", "broker1"))
        .await
        .unwrap();
    store.fail_del_will.store(true, Ordering::SeqCst);

    let broker = broker_with(Duration::from_millis(25), store.clone(), Arc::new(DefaultHooks));
    let mut events = broker.events();

    let event = wait_for(&mut events, |e| matches!(e, BrokerEvent::BrokerError { .. })).await;
    match event {
        BrokerEvent::BrokerError { message } => {
            assert!(
                message.contains("Throws error"),
                "failure text preserved: {}",
                message
            );
        }
        _ => unreachable!(),
    }
    broker.close().await;
}

#[tokio::test]
async fn test_retained_will_store_failure_surfaces_on_error_channel() {
    let store = Arc::new(FailingPersistence::new());
    let mut record = orphan_will("myClientId42", "broker1");
    record.retain = true;
    store.inner.put_will(record).await.unwrap();
    store.fail_store_retained.store(true, Ordering::SeqCst);

    let broker = broker_with(Duration::from_millis(25), store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let event = wait_for(&mut events, |e| matches!(e, BrokerEvent::BrokerError { .. })).await;
    match event {
        BrokerEvent::BrokerError { message } => {
            assert!(
                message.contains("Throws error"),
                "failure text preserved: {}",
                message
            );
        }
        _ => unreachable!(),
    }
    // storing the retained copy failed, so nothing was fanned out
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    broker.close().await;
}

#[tokio::test]
async fn test_will_store_failure_aborts_connect_without_delivery() {
    let store = Arc::new(FailingPersistence::new());
    store.fail_put_will.store(true, Ordering::SeqCst);
    let broker = broker_with(Duration::ZERO, store.clone(), Arc::new(DefaultHooks));
    let mut will_rx = watch(&broker, "mywill");
    let mut events = broker.events();

    let (client, mut rx) = broker.attach();
    let err = client
        .handle(Packet::Connect(Box::new(will_connect("c1"))))
        .await
        .expect_err("storing the will record must fail the connect");
    assert!(matches!(err, SessionError::Persistence(_)));

    // the session never came up: no CONNACK went out, nothing was admitted,
    // and the will of a never-acknowledged session must not fire
    let leftover = timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("connection should close");
    assert!(leftover.is_none(), "no CONNACK before the failure");
    assert_eq!(broker.connected_clients(), 0);
    wait_for(&mut events, |e| matches!(e, BrokerEvent::ClientError { .. })).await;
    expect_silence(&mut will_rx, Duration::from_millis(100)).await;
    assert!(store.inner.get_will("c1").await.unwrap().is_none());
    broker.close().await;
}

#[tokio::test]
async fn test_broker_close_delivers_wills_of_connected_clients() {
    let broker = broker_with(
        Duration::ZERO,
        Arc::new(MemoryPersistence::new()),
        Arc::new(DefaultHooks),
    );
    let mut events = broker.events();
    let _conn = TestConn::connect(&broker, will_connect("c1")).await;

    broker.close().await;

    let mut saw_will = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        if let BrokerEvent::Publish { topic, .. } = &event {
            if topic.as_ref() == "mywill" {
                saw_will = true;
            }
        }
    }
    assert!(saw_will, "closing the broker delivers the will");
}

//! Broker liveness and will takeover.
//!
//! Every broker publishes `$SYS/<id>/heartbeat` once per interval and
//! watches for the heartbeats of siblings sharing its persistence backend.
//! A sibling that misses three intervals is pruned from the registry; a will
//! whose owner has been silent for that long is delivered here and removed,
//! so the clients of a crashed broker still get their last messages out.

use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use super::{will, Broker};

/// Missed intervals after which a sibling counts as dead
const STALE_TICKS: u32 = 3;

/// Register the sibling heartbeat observer and start the tick task.
///
/// Does nothing when the heartbeat interval is zero.
pub(super) fn spawn(broker: &Arc<Broker>) {
    let interval = broker.options.heartbeat_interval;
    if interval.is_zero() {
        return;
    }

    let weak: Weak<Broker> = Arc::downgrade(broker);
    let _ = broker.matcher.observe(
        "$SYS/+/heartbeat",
        Arc::new(move |publish| {
            if let Some(broker) = weak.upgrade() {
                note_sibling(&broker, &publish.payload);
            }
        }),
    );

    let mut shutdown = broker.shutdown.subscribe();
    let owner = broker.clone();
    let task = tokio::spawn(async move {
        let first = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(first, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(&owner).await,
                _ = shutdown.recv() => return,
            }
        }
    });
    *broker.heartbeat.lock() = Some(task);
}

/// A sibling heartbeat arrived; its payload is the sibling's broker id
fn note_sibling(broker: &Broker, payload: &[u8]) {
    let id = String::from_utf8_lossy(payload);
    if id.is_empty() || id.as_ref() == &*broker.id {
        return;
    }
    let id: Arc<str> = Arc::from(id.as_ref());
    broker.silent_since.remove(&id);
    broker.peers.insert(id, Instant::now());
}

async fn tick(broker: &Broker) {
    let interval = broker.options.heartbeat_interval;
    let stale_after = interval * STALE_TICKS;
    let now = Instant::now();

    // Own liveness first, so the scan below never treats this broker as silent
    broker.peers.insert(broker.id.clone(), now);
    broker
        .sys_publish("heartbeat", Bytes::copy_from_slice(broker.id.as_bytes()))
        .await;

    // Prune siblings that missed their window, remembering when each fell silent
    broker.peers.retain(|id, last_seen| {
        if now.duration_since(*last_seen) > stale_after {
            debug!("sibling broker {} heartbeat expired", id);
            broker.silent_since.entry(id.clone()).or_insert(*last_seen);
            false
        } else {
            true
        }
    });

    // Hand out wills whose owner has been silent for a full staleness window
    let wills = match broker.persistence.wills().await {
        Ok(wills) => wills,
        Err(err) => {
            broker.report_error("scanning wills", &err);
            return;
        }
    };
    for record in wills {
        if record.broker_id == broker.id {
            continue;
        }
        if broker.peers.contains_key(&record.broker_id) {
            continue;
        }
        // An owner we never heard from counts as silent since this broker started
        let since = *broker
            .silent_since
            .entry(record.broker_id.clone())
            .or_insert(broker.started_at);
        if now.duration_since(since) >= stale_after {
            will::deliver_orphan(broker, record).await;
        }
    }
}

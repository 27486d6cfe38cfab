//! Bundled in-memory persistence.
//!
//! The default store: correct contract semantics with no durability.
//! Sessions survive reconnects as long as the process lives. Deployments
//! that need durable sessions plug in an external [`Persistence`]
//! implementation instead.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::error::{PersistenceError, Result};
use super::models::{RetainedMessage, StoredSubscription, WillRecord};
use super::store::Persistence;
use crate::qos::{DeliveryStage, Direction, Inflight};
use crate::topic::topic_matches_filter;

/// In-memory [`Persistence`] backed by concurrent maps.
#[derive(Default)]
pub struct MemoryPersistence {
    subscriptions: DashMap<Arc<str>, Vec<StoredSubscription>>,
    retained: DashMap<Arc<str>, RetainedMessage>,
    wills: DashMap<Arc<str>, WillRecord>,
    // Vec keeps insertion order, which is the replay order on resume
    inflight: DashMap<Arc<str>, Vec<Inflight>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn add_subscriptions(
        &self,
        client_id: &str,
        subs: &[StoredSubscription],
    ) -> Result<()> {
        let mut stored = self
            .subscriptions
            .entry(Arc::from(client_id))
            .or_default();
        for sub in subs {
            stored.retain(|s| s.filter != sub.filter);
            stored.push(sub.clone());
        }
        Ok(())
    }

    async fn remove_subscriptions(&self, client_id: &str, filters: &[String]) -> Result<()> {
        if let Some(mut stored) = self.subscriptions.get_mut(client_id) {
            stored.retain(|s| !filters.contains(&s.filter));
        }
        Ok(())
    }

    async fn subscriptions(&self, client_id: &str) -> Result<Vec<StoredSubscription>> {
        Ok(self
            .subscriptions
            .get(client_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }

    async fn store_retained(&self, message: RetainedMessage) -> Result<()> {
        if message.payload.is_empty() {
            self.retained.remove(message.topic.as_ref());
        } else {
            self.retained.insert(message.topic.clone(), message);
        }
        Ok(())
    }

    async fn retained_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>> {
        Ok(self
            .retained
            .iter()
            .filter(|entry| topic_matches_filter(entry.key(), filter))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn put_will(&self, will: WillRecord) -> Result<()> {
        self.wills.insert(will.client_id.clone(), will);
        Ok(())
    }

    async fn get_will(&self, client_id: &str) -> Result<Option<WillRecord>> {
        Ok(self.wills.get(client_id).map(|w| w.clone()))
    }

    async fn del_will(&self, client_id: &str) -> Result<Option<WillRecord>> {
        Ok(self.wills.remove(client_id).map(|(_, will)| will))
    }

    async fn wills(&self) -> Result<Vec<WillRecord>> {
        Ok(self.wills.iter().map(|e| e.value().clone()).collect())
    }

    async fn inflight_store(&self, client_id: &str, record: &Inflight) -> Result<()> {
        let mut records = self.inflight.entry(Arc::from(client_id)).or_default();
        records.retain(|r| {
            !(r.direction == record.direction && r.packet_id == record.packet_id)
        });
        records.push(record.clone());
        Ok(())
    }

    async fn inflight_update(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
        stage: DeliveryStage,
    ) -> Result<()> {
        let mut records = self
            .inflight
            .get_mut(client_id)
            .ok_or(PersistenceError::NotFound("inflight record"))?;
        let record = records
            .iter_mut()
            .find(|r| r.direction == direction && r.packet_id == packet_id)
            .ok_or(PersistenceError::NotFound("inflight record"))?;
        record.stage = stage;
        Ok(())
    }

    async fn inflight_remove(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
    ) -> Result<()> {
        if let Some(mut records) = self.inflight.get_mut(client_id) {
            records.retain(|r| !(r.direction == direction && r.packet_id == packet_id));
        }
        Ok(())
    }

    async fn inflight(&self, client_id: &str) -> Result<Vec<Inflight>> {
        Ok(self
            .inflight
            .get(client_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }

    async fn clear_client(&self, client_id: &str) -> Result<()> {
        self.subscriptions.remove(client_id);
        self.inflight.remove(client_id);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

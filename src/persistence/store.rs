//! Persistence trait for session state.
//!
//! This trait defines the interface for persistence backends, allowing
//! different implementations (in-memory, LSM-tree, Redis, etc.). The broker
//! awaits every write that guards a QoS stage transition, so a backend's
//! durability is exactly the broker's durability.

use async_trait::async_trait;

use super::error::Result;
use super::models::{RetainedMessage, StoredSubscription, WillRecord};
use crate::qos::{DeliveryStage, Direction, Inflight};

/// Storage seam for everything that outlives a connection.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Subscriptions (persistent sessions)
    // ========================================================================

    /// Add or replace subscriptions for a client
    async fn add_subscriptions(&self, client_id: &str, subs: &[StoredSubscription])
        -> Result<()>;

    /// Remove the given filters for a client
    async fn remove_subscriptions(&self, client_id: &str, filters: &[String]) -> Result<()>;

    /// All stored subscriptions for a client
    async fn subscriptions(&self, client_id: &str) -> Result<Vec<StoredSubscription>>;

    // ========================================================================
    // Retained messages
    // ========================================================================

    /// Store a retained message; an empty payload clears the topic
    async fn store_retained(&self, message: RetainedMessage) -> Result<()>;

    /// All retained messages whose topic the filter covers
    async fn retained_matching(&self, filter: &str) -> Result<Vec<RetainedMessage>>;

    // ========================================================================
    // Wills
    // ========================================================================

    /// Store a will, replacing any previous record for the client
    async fn put_will(&self, will: WillRecord) -> Result<()>;

    /// The stored will for a client, if any
    async fn get_will(&self, client_id: &str) -> Result<Option<WillRecord>>;

    /// Remove and return the stored will for a client
    async fn del_will(&self, client_id: &str) -> Result<Option<WillRecord>>;

    /// Every stored will, across all owning brokers
    async fn wills(&self) -> Result<Vec<WillRecord>>;

    // ========================================================================
    // Inflight QoS state
    // ========================================================================

    /// Store a new inflight record for a client
    async fn inflight_store(&self, client_id: &str, record: &Inflight) -> Result<()>;

    /// Advance the stage of an existing record.
    ///
    /// Fails with [`PersistenceError::NotFound`] when no record exists for
    /// the id, which the broker treats as a session error.
    ///
    /// [`PersistenceError::NotFound`]: super::PersistenceError::NotFound
    async fn inflight_update(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
        stage: DeliveryStage,
    ) -> Result<()>;

    /// Drop a completed record
    async fn inflight_remove(
        &self,
        client_id: &str,
        direction: Direction,
        packet_id: u16,
    ) -> Result<()>;

    /// All inflight records for a client, in storage order
    async fn inflight(&self, client_id: &str) -> Result<Vec<Inflight>>;

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Drop all session state for a client (subscriptions and inflight)
    async fn clear_client(&self, client_id: &str) -> Result<()>;

    /// Close the backend and release resources
    async fn close(&self) -> Result<()>;
}

//! Persistence seam for session state.
//!
//! Provides storage for:
//! - Retained messages
//! - Persistent-session subscriptions
//! - Inflight QoS 1/2 handshakes
//! - Wills, tagged with their owning broker
//!
//! Uses a trait-based design allowing different backends. The bundled
//! [`MemoryPersistence`] keeps everything in process memory; durable
//! backends live outside this crate.

mod error;
mod memory;
mod models;
mod store;

pub use error::{PersistenceError, Result};
pub use memory::MemoryPersistence;
pub use models::{RetainedMessage, StoredSubscription, WillRecord};
pub use store::Persistence;

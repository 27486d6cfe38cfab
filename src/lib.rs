//! Culex - Embeddable MQTT v3.1.1 broker engine
//!
//! A transport-agnostic broker core: attach connections, feed decoded
//! packets in, drain outbound packets out. Persistence and authorization
//! are pluggable, and several brokers sharing one persistence backend watch
//! each other's heartbeats so the wills of a crashed sibling still go out.

pub mod broker;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod qos;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerEvent, BrokerOptions, Client, SessionError};
pub use hooks::{DefaultHooks, HookError, HookResult, Hooks};
pub use persistence::{
    MemoryPersistence, Persistence, PersistenceError, RetainedMessage, StoredSubscription,
    WillRecord,
};
pub use protocol::{Packet, ProtocolError, QoS};
pub use qos::{DeliveryStage, Direction, Inflight};
pub use topic::{ObserverToken, validate_topic_filter, validate_topic_name};

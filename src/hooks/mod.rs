//! Hooks Module
//!
//! Extensibility points for authentication and authorization. The broker
//! awaits every hook before acting on the outcome, so implementations may
//! call out to external services.

use std::fmt;

use async_trait::async_trait;

use crate::broker::Client;
use crate::protocol::{Publish, Subscription};


/// Hook error types
#[derive(Debug)]
pub enum HookError {
    /// Internal error
    Internal(String),
    /// Authentication failed
    AuthenticationFailed,
    /// Authorization denied
    AuthorizationDenied,
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "Internal error: {}", msg),
            HookError::AuthenticationFailed => write!(f, "Authentication failed"),
            HookError::AuthorizationDenied => write!(f, "Authorization denied"),
        }
    }
}

impl std::error::Error for HookError {}

/// Hook result type
pub type HookResult<T> = Result<T, HookError>;

/// Broker hooks trait
///
/// Implement this trait to control who may connect, publish, and
/// subscribe. All methods have default implementations that allow
/// everything.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Called when a client presents its CONNECT credentials
    ///
    /// # Returns
    /// * `Ok(true)` - Authentication successful
    /// * `Ok(false)` - Authentication failed (CONNACK bad credentials)
    /// * `Err(_)` - Internal error occurred
    async fn authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true) // Default: allow all
    }

    /// Called before a publish is routed to subscribers.
    ///
    /// `client` is `None` when the publish comes from will or orphan-will
    /// delivery rather than a live connection. A denied publish is dropped
    /// without reaching any subscriber; for QoS > 0 the sender still gets
    /// its acknowledgement.
    async fn authorize_publish(
        &self,
        _client: Option<&Client>,
        _publish: &Publish,
    ) -> HookResult<bool> {
        Ok(true) // Default: allow all
    }

    /// Called for each filter in a SUBSCRIBE request.
    ///
    /// # Returns
    /// * `Ok(Some(subscription))` - grant, possibly with a rewritten filter
    ///   or a reduced QoS
    /// * `Ok(None)` - deny this filter (the client sees a failure grant)
    /// * `Err(_)` - Internal error occurred
    async fn authorize_subscribe(
        &self,
        _client: &Client,
        requested: &Subscription,
    ) -> HookResult<Option<Subscription>> {
        Ok(Some(requested.clone())) // Default: grant as requested
    }
}

/// Default hooks implementation that allows everything
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {
    // All methods use default implementations (allow all)
}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

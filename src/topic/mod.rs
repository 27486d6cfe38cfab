//! Topic matching and subscription management
//!
//! Validation of topic names and filters plus the broker-wide matcher. The
//! matcher holds client subscriptions and broker-internal observers in one
//! wildcard trie; a publish resolves to the set of covered client
//! subscriptions and the observer callbacks to invoke.

mod trie;
pub mod validation;

pub use trie::FilterTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{Publish, QoS};

/// A client subscription as held by the matcher
#[derive(Debug, Clone)]
pub struct ClientSubscription {
    /// Client ID
    pub client_id: Arc<str>,
    /// Granted maximum QoS
    pub qos: QoS,
}

/// Callback invoked for broker-internal deliveries
pub type ObserverFn = dyn Fn(&Publish) + Send + Sync;

/// Handle for removing an observer registered with [`Matcher::observe`]
#[derive(Debug)]
pub struct ObserverToken {
    id: u64,
    filter: String,
}

enum Entry {
    Client(ClientSubscription),
    Observer { id: u64, handler: Arc<ObserverFn> },
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Client(sub) => f.debug_tuple("Client").field(sub).finish(),
            Entry::Observer { id, .. } => f.debug_struct("Observer").field("id", id).finish(),
        }
    }
}

/// Everything a topic resolves to: client subscriptions for wire delivery
/// and observer callbacks for in-process delivery.
#[derive(Default)]
pub struct MatchSet {
    pub clients: SmallVec<[ClientSubscription; 16]>,
    pub observers: SmallVec<[Arc<ObserverFn>; 2]>,
}

/// Thread-safe subscription matcher backed by the filter trie.
///
/// The write lock is only held for the duration of a trie operation, never
/// across observer callbacks.
pub struct Matcher {
    trie: RwLock<FilterTrie<Vec<Entry>>>,
    next_observer_id: AtomicU64,
}

impl Matcher {
    pub fn new() -> Self {
        Self {
            trie: RwLock::new(FilterTrie::new()),
            next_observer_id: AtomicU64::new(1),
        }
    }

    /// Add or replace a client subscription.
    ///
    /// A client re-subscribing to a filter it already holds replaces the
    /// granted QoS instead of adding a second entry.
    pub fn subscribe(&self, filter: &str, subscription: ClientSubscription) {
        let mut trie = self.trie.write();
        if let Some(entries) = trie.get_mut(filter) {
            entries.retain(|e| match e {
                Entry::Client(sub) => sub.client_id != subscription.client_id,
                Entry::Observer { .. } => true,
            });
            entries.push(Entry::Client(subscription));
        } else {
            trie.insert(filter, vec![Entry::Client(subscription)]);
        }
    }

    /// Remove one client subscription. Returns whether it existed.
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(entries) = trie.get_mut(filter) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|e| match e {
            Entry::Client(sub) => sub.client_id.as_ref() != client_id,
            Entry::Observer { .. } => true,
        });
        let removed = entries.len() != before;
        if entries.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove every subscription held by a client. Observers are untouched.
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.retain(|entries| {
            entries.retain(|e| match e {
                Entry::Client(sub) => sub.client_id.as_ref() != client_id,
                Entry::Observer { .. } => true,
            });
            !entries.is_empty()
        });
    }

    /// Register a broker-internal observer for a filter
    pub fn observe(&self, filter: &str, handler: Arc<ObserverFn>) -> ObserverToken {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry::Observer { id, handler };

        let mut trie = self.trie.write();
        if let Some(entries) = trie.get_mut(filter) {
            entries.push(entry);
        } else {
            trie.insert(filter, vec![entry]);
        }

        ObserverToken {
            id,
            filter: filter.to_string(),
        }
    }

    /// Remove an observer previously registered with [`Matcher::observe`]
    pub fn unobserve(&self, token: &ObserverToken) {
        let mut trie = self.trie.write();
        if let Some(entries) = trie.get_mut(&token.filter) {
            entries.retain(|e| match e {
                Entry::Client(_) => true,
                Entry::Observer { id, .. } => *id != token.id,
            });
            if entries.is_empty() {
                trie.remove(&token.filter);
            }
        }
    }

    /// Resolve a topic to its client subscriptions and observer callbacks.
    ///
    /// Observer handlers are returned, not invoked, so callers run them
    /// outside the matcher lock.
    pub fn matching(&self, topic: &str) -> MatchSet {
        let trie = self.trie.read();
        let mut set = MatchSet::default();

        trie.matches(topic, |entries| {
            for entry in entries {
                match entry {
                    Entry::Client(sub) => set.clients.push(sub.clone()),
                    Entry::Observer { handler, .. } => set.observers.push(handler.clone()),
                }
            }
        });

        set
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new()
    }
}

//! Registry of active Observe subscriptions.
//!
//! A subscription is identified by the peer address and the token of its
//! registration request. Each one is a running notification task; the
//! registry keeps the task's abort handle so subscriptions can be counted,
//! bounded, replaced and cancelled on shutdown.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::debug;

/// Identity of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub peer: SocketAddr,
    pub token: Vec<u8>,
}

impl SubscriptionKey {
    pub fn new(peer: SocketAddr, token: &[u8]) -> Self {
        Self {
            peer,
            token: token.to_vec(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#", self.peer)?;
        for byte in &self.token {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Errors returned when registering a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The configured subscription limit is reached.
    #[error("subscription limit of {0} reached")]
    Full(usize),
}

#[derive(Debug)]
struct Entry {
    id: u64,
    handle: AbortHandle,
    registered_at: DateTime<Utc>,
}

/// Tracks the notification task of every active subscription.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    max_subscriptions: Option<usize>,
    next_id: AtomicU64,
    entries: Mutex<HashMap<SubscriptionKey, Entry>>,
}

impl SubscriptionRegistry {
    /// Create a registry; `None` leaves the subscription count unbounded.
    pub fn new(max_subscriptions: Option<usize>) -> Self {
        Self {
            max_subscriptions,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn `task` as the notification task for `key`.
    ///
    /// An existing subscription with the same key is aborted and replaced;
    /// replacing does not count against the limit. The entry is removed when
    /// `task` completes.
    pub fn spawn<F>(self: &Arc<Self>, key: SubscriptionKey, task: F) -> Result<(), RegistryError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.entries();

        let replacing = entries.contains_key(&key);
        if let Some(max) = self.max_subscriptions {
            if !replacing && entries.len() >= max {
                return Err(RegistryError::Full(max));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            task.await;
            registry.finish(&task_key, id);
        })
        .abort_handle();

        let entry = Entry {
            id,
            handle,
            registered_at: Utc::now(),
        };
        if let Some(previous) = entries.insert(key.clone(), entry) {
            debug!(subscription = %key, "Replacing existing subscription");
            previous.handle.abort();
        }
        Ok(())
    }

    /// Remove `key` if it still belongs to the task with `id`.
    fn finish(&self, key: &SubscriptionKey, id: u64) {
        let mut entries = self.entries();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
            debug!(subscription = %key, "Subscription ended");
        }
    }

    /// Abort the subscription for `key`. Returns whether one existed.
    pub fn cancel(&self, key: &SubscriptionKey) -> bool {
        match self.entries().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every subscription. Returns how many were running.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Entry> = self.entries().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.handle.abort();
        }
        drained.len()
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries().contains_key(key)
    }

    /// When the subscription for `key` was registered.
    pub fn registered_at(&self, key: &SubscriptionKey) -> Option<DateTime<Utc>> {
        self.entries().get(key).map(|entry| entry.registered_at)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

//! Duplicate detection for inbound requests.
//!
//! Clients retransmit a confirmable request until they see its ACK, so the
//! same (peer, message ID) can arrive more than once. The first copy is
//! dispatched. Later copies within [`EXCHANGE_LIFETIME`] are answered with
//! the reply already sent for it, or dropped if there is none yet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// How long a message ID stays reserved (RFC 7252 section 4.8.2).
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Exchanges remembered at most; the oldest is evicted beyond this.
pub const DEFAULT_MAX_EXCHANGES: usize = 1024;

/// Verdict for an inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    /// First time this message ID is seen from the peer.
    New,
    /// Seen before; carries the encoded reply if one has been sent.
    Duplicate(Option<Vec<u8>>),
}

#[derive(Debug)]
struct Entry {
    seen_at: Instant,
    reply: Option<Vec<u8>>,
}

/// Recently seen (peer, message ID) pairs and their replies.
#[derive(Debug)]
pub struct ExchangeCache {
    lifetime: Duration,
    capacity: usize,
    entries: Mutex<HashMap<(SocketAddr, u16), Entry>>,
}

impl Default for ExchangeCache {
    fn default() -> Self {
        Self::new(EXCHANGE_LIFETIME, DEFAULT_MAX_EXCHANGES)
    }
}

impl ExchangeCache {
    pub fn new(lifetime: Duration, capacity: usize) -> Self {
        Self {
            lifetime,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<(SocketAddr, u16), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Classify a request and remember it if it is new.
    pub fn check(&self, peer: SocketAddr, message_id: u16) -> Exchange {
        let now = Instant::now();
        let mut entries = self.entries();

        if let Some(entry) = entries.get(&(peer, message_id)) {
            if now.duration_since(entry.seen_at) < self.lifetime {
                return Exchange::Duplicate(entry.reply.clone());
            }
        }

        if entries.len() >= self.capacity {
            let lifetime = self.lifetime;
            entries.retain(|_, entry| now.duration_since(entry.seen_at) < lifetime);
        }
        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.seen_at)
                .map(|(key, _)| *key);
            if let Some(key) = oldest {
                debug!(client = %key.0, mid = key.1, "Evicting exchange");
                entries.remove(&key);
            }
        }

        entries.insert(
            (peer, message_id),
            Entry {
                seen_at: now,
                reply: None,
            },
        );
        Exchange::New
    }

    /// Attach the reply sent for a known exchange. Unknown exchanges are ignored.
    pub fn store_reply(&self, peer: SocketAddr, message_id: u16, datagram: &[u8]) {
        if let Some(entry) = self.entries().get_mut(&(peer, message_id)) {
            entry.reply = Some(datagram.to_vec());
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

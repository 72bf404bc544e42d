//! Short-lived memory of inbound message IDs.

use std::collections::{hash_map::Entry, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    New,
    Duplicate,
}

#[derive(Debug)]
struct DedupEntry {
    seen_at: Instant,
    reply: Option<Vec<u8>>,
}

/// Remembers (peer, message-ID) pairs for one exchange lifetime.
///
/// Entries are queued in arrival order, so expiry pops from the front and
/// each insert pays only for the entries that have already expired.
#[derive(Debug)]
pub struct DedupCache {
    lifetime: Duration,
    entries: HashMap<(SocketAddr, u16), DedupEntry>,
    order: VecDeque<(Instant, SocketAddr, u16)>,
}

impl DedupCache {
    pub fn new(lifetime: Duration) -> DedupCache {
        DedupCache {
            lifetime,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Records `message_id` from `peer`, reporting whether it was already
    /// seen within the lifetime window.
    pub fn observe(&mut self, peer: SocketAddr, message_id: u16, now: Instant) -> Observation {
        self.evict_expired(now);

        match self.entries.entry((peer, message_id)) {
            Entry::Occupied(_) => Observation::Duplicate,
            Entry::Vacant(v) => {
                v.insert(DedupEntry {
                    seen_at: now,
                    reply: None,
                });
                self.order.push_back((now, peer, message_id));
                Observation::New
            }
        }
    }

    /// Remembers the encoded reply sent for a message so duplicates can be
    /// answered without involving the application again.
    pub fn set_reply(&mut self, peer: SocketAddr, message_id: u16, reply: Vec<u8>) {
        if let Some(entry) = self.entries.get_mut(&(peer, message_id)) {
            entry.reply = Some(reply);
        }
    }

    pub fn cached_reply(&self, peer: SocketAddr, message_id: u16) -> Option<&[u8]> {
        self.entries
            .get(&(peer, message_id))
            .and_then(|entry| entry.reply.as_deref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some(&(seen_at, peer, message_id)) = self.order.front() {
            if now.saturating_duration_since(seen_at) < self.lifetime {
                break;
            }
            self.order.pop_front();
            if let Entry::Occupied(entry) = self.entries.entry((peer, message_id)) {
                if entry.get().seen_at == seen_at {
                    entry.remove();
                }
            }
        }
    }
}

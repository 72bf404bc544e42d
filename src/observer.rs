//! Observe relations, both ends.
//!
//! The server keeps an [`ObserveRegistry`] of who observes what and numbers
//! its notifications. The client receives notifications through an
//! [`ObserveStream`] and drops those that arrive out of order.

use std::collections::{hash_map::Entry, HashMap};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use log::debug;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use crate::message::{hex, Message};

/// OBSERVE values are 24-bit.
const SEQUENCE_MASK: u32 = 0xFF_FFFF;
const SEQUENCE_HALF: u32 = 1 << 23;
/// After this long any notification is newer than the last one seen.
const FRESHNESS_WINDOW: Duration = Duration::from_secs(128);

/// A client observing a resource of this endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObserveRelation {
    peer: SocketAddr,
    token: Vec<u8>,
    path: String,
}

impl ObserveRelation {
    pub(crate) fn new(peer: SocketAddr, token: Vec<u8>, path: String) -> ObserveRelation {
        ObserveRelation { peer, token, path }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[derive(Debug)]
struct RelationState {
    path: String,
    sequence: u32,
    last_message_id: Option<u16>,
}

/// Relations keyed by (peer, token).
#[derive(Debug, Default)]
pub struct ObserveRegistry {
    relations: HashMap<(SocketAddr, Vec<u8>), RelationState>,
    message_ids: HashMap<(SocketAddr, u16), Vec<u8>>,
}

impl ObserveRegistry {
    pub fn new() -> ObserveRegistry {
        ObserveRegistry::default()
    }

    /// Adds or refreshes a relation, returning the sequence number for the
    /// registration response.
    pub fn register(&mut self, relation: &ObserveRelation) -> u32 {
        debug!(
            "register {} {} {}",
            relation.peer,
            relation.path,
            hex(&relation.token)
        );
        match self.relations.entry((relation.peer, relation.token.clone())) {
            Entry::Occupied(occupied) => {
                let state = occupied.into_mut();
                state.path = relation.path.clone();
                state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
                state.sequence
            }
            Entry::Vacant(v) => {
                v.insert(RelationState {
                    path: relation.path.clone(),
                    sequence: 0,
                    last_message_id: None,
                });
                0
            }
        }
    }

    /// Removes the relation with `token` from `peer`. Returns whether there
    /// was one.
    pub fn deregister(&mut self, peer: SocketAddr, token: &[u8]) -> bool {
        match self.relations.remove(&(peer, token.to_vec())) {
            Some(state) => {
                debug!("deregister {} {} {}", peer, state.path, hex(token));
                if let Some(message_id) = state.last_message_id {
                    self.message_ids.remove(&(peer, message_id));
                }
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, relation: &ObserveRelation) -> bool {
        self.relations
            .contains_key(&(relation.peer, relation.token.clone()))
    }

    /// The sequence number for the next notification, or `None` if the
    /// relation has ended.
    pub fn next_sequence(&mut self, relation: &ObserveRelation) -> Option<u32> {
        let state = self
            .relations
            .get_mut(&(relation.peer, relation.token.clone()))?;
        state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
        Some(state.sequence)
    }

    /// Remembers the message ID of the latest notification so that a reset
    /// for it can be traced back to the relation.
    pub fn record_message_id(&mut self, relation: &ObserveRelation, message_id: u16) {
        let Some(state) = self
            .relations
            .get_mut(&(relation.peer, relation.token.clone()))
        else {
            return;
        };
        if let Some(previous) = state.last_message_id.replace(message_id) {
            self.message_ids.remove(&(relation.peer, previous));
        }
        self.message_ids
            .insert((relation.peer, message_id), relation.token.clone());
    }

    /// Ends the relation whose latest notification was `message_id`.
    pub fn reset(&mut self, peer: SocketAddr, message_id: u16) -> bool {
        match self.message_ids.remove(&(peer, message_id)) {
            Some(token) => self.deregister(peer, &token),
            None => false,
        }
    }

    /// Relations observing `path`.
    pub fn relations(&self, path: &str) -> Vec<ObserveRelation> {
        self.relations
            .iter()
            .filter(|(_, state)| state.path == path)
            .map(|((peer, token), state)| {
                ObserveRelation::new(*peer, token.clone(), state.path.clone())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

/// Orders notifications by their OBSERVE sequence number.
#[derive(Debug, Default)]
pub(crate) struct Freshness {
    last: Option<(u32, Instant)>,
}

impl Freshness {
    /// Whether a notification with `sequence` received at `now` is newer
    /// than everything accepted so far. Accepting it records it.
    pub(crate) fn accept(&mut self, sequence: u32, now: Instant) -> bool {
        let fresh = match self.last {
            None => true,
            Some((last, received_at)) => {
                (last < sequence && sequence - last < SEQUENCE_HALF)
                    || (last > sequence && last - sequence > SEQUENCE_HALF)
                    || now.saturating_duration_since(received_at) > FRESHNESS_WINDOW
            }
        };
        if fresh {
            self.last = Some((sequence, now));
        }
        fresh
    }
}

/// Notifications of one observe relation, starting with the response to
/// the registration.
///
/// The stream ends when the server stops the relation (a response without
/// OBSERVE), the relation fails or the endpoint closes. Dropping it ends
/// the relation: later notifications are answered with a reset.
#[derive(Debug)]
pub struct ObserveStream {
    token: Vec<u8>,
    inner: ReceiverStream<Message>,
}

impl ObserveStream {
    pub(crate) fn new(token: Vec<u8>, receiver: mpsc::Receiver<Message>) -> ObserveStream {
        ObserveStream {
            token,
            inner: ReceiverStream::new(receiver),
        }
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

impl Stream for ObserveStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

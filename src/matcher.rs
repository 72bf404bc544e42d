//! Correlates inbound responses, acknowledgements and resets with the
//! exchanges waiting for them.

use std::collections::HashMap;
use std::net::SocketAddr;

use log::debug;

use crate::error::CoapError;
use crate::message::{hex, Message, MessageClass, MessageType};

pub type ExchangeId = u64;

#[derive(Debug)]
struct Registration<H> {
    peer: SocketAddr,
    token: Option<Vec<u8>>,
    message_id: Option<u16>,
    handle: H,
}

/// Registry of outstanding exchanges, indexed by (peer, token) for
/// responses and by (peer, message-ID) for empty ACK/RST.
///
/// `H` is whatever the owner uses to signal an exchange; the matcher only
/// stores and returns it.
#[derive(Debug)]
pub struct ExchangeMatcher<H> {
    next_id: ExchangeId,
    exchanges: HashMap<ExchangeId, Registration<H>>,
    by_token: HashMap<(SocketAddr, Vec<u8>), ExchangeId>,
    by_message_id: HashMap<(SocketAddr, u16), ExchangeId>,
}

impl<H> Default for ExchangeMatcher<H> {
    fn default() -> Self {
        ExchangeMatcher {
            next_id: 0,
            exchanges: HashMap::new(),
            by_token: HashMap::new(),
            by_message_id: HashMap::new(),
        }
    }
}

impl<H> ExchangeMatcher<H> {
    pub fn new() -> ExchangeMatcher<H> {
        ExchangeMatcher::default()
    }

    /// Registers a request exchange. Only one exchange may use a token
    /// towards a given peer at a time.
    pub fn register(
        &mut self,
        peer: SocketAddr,
        token: Vec<u8>,
        handle: H,
    ) -> Result<ExchangeId, CoapError> {
        let key = (peer, token);
        if self.by_token.contains_key(&key) {
            return Err(CoapError::TokenInUse {
                peer,
                token: key.1,
            });
        }

        let id = self.allocate_id();
        self.by_token.insert(key.clone(), id);
        self.exchanges.insert(
            id,
            Registration {
                peer,
                token: Some(key.1),
                message_id: None,
                handle,
            },
        );
        Ok(id)
    }

    /// Registers a confirmable message that only expects an empty ACK or RST.
    pub fn register_transmission(
        &mut self,
        peer: SocketAddr,
        message_id: u16,
        handle: H,
    ) -> ExchangeId {
        let id = self.allocate_id();
        self.exchanges.insert(
            id,
            Registration {
                peer,
                token: None,
                message_id: None,
                handle,
            },
        );
        self.bind_message_id(id, message_id);
        id
    }

    /// Points ACK/RST correlation at the exchange's latest transmission.
    pub fn bind_message_id(&mut self, id: ExchangeId, message_id: u16) {
        let Some(registration) = self.exchanges.get_mut(&id) else {
            return;
        };
        let peer = registration.peer;
        if let Some(previous) = registration.message_id.replace(message_id) {
            if self.by_message_id.get(&(peer, previous)) == Some(&id) {
                self.by_message_id.remove(&(peer, previous));
            }
        }
        if let Some(stale) = self.by_message_id.insert((peer, message_id), id) {
            if stale != id {
                debug!("message id {} to {} rebound from exchange {}", message_id, peer, stale);
            }
        }
    }

    pub fn is_token_in_use(&self, peer: SocketAddr, token: &[u8]) -> bool {
        self.by_token.contains_key(&(peer, token.to_vec()))
    }

    /// Finds the exchange an inbound message belongs to.
    pub fn match_message(&self, peer: SocketAddr, message: &Message) -> Option<(ExchangeId, &H)> {
        let message_id = message.header.get_message_id();
        let id = match (message.header.code, message.header.get_type()) {
            (MessageClass::Request(_), _) => return None,
            (MessageClass::Empty, _) | (_, MessageType::Reset) => {
                *self.by_message_id.get(&(peer, message_id))?
            }
            (MessageClass::Response(_), message_type) => {
                let id = *self.by_token.get(&(peer, message.get_token().to_vec()))?;
                if message_type == MessageType::Acknowledgement
                    && self.exchanges.get(&id)?.message_id != Some(message_id)
                {
                    debug!(
                        "piggybacked response {} from {} does not match token {}",
                        message_id,
                        peer,
                        hex(message.get_token())
                    );
                    return None;
                }
                id
            }
        };
        self.exchanges
            .get(&id)
            .map(|registration| (id, &registration.handle))
    }

    /// Releases an exchange and all of its index entries.
    pub fn remove(&mut self, id: ExchangeId) -> Option<H> {
        let registration = self.exchanges.remove(&id)?;
        if let Some(token) = registration.token {
            self.by_token.remove(&(registration.peer, token));
        }
        if let Some(message_id) = registration.message_id {
            if self.by_message_id.get(&(registration.peer, message_id)) == Some(&id) {
                self.by_message_id.remove(&(registration.peer, message_id));
            }
        }
        Some(registration.handle)
    }

    /// Releases every exchange, returning their handles.
    pub fn drain(&mut self) -> Vec<H> {
        self.by_token.clear();
        self.by_message_id.clear();
        self.exchanges
            .drain()
            .map(|(_, registration)| registration.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    fn allocate_id(&mut self) -> ExchangeId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{RequestType, ResponseType};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn response(message_type: MessageType, message_id: u16, token: &[u8]) -> Message {
        let mut message = Message::new();
        message.header.set_type(message_type);
        message.header.code = MessageClass::Response(ResponseType::Content);
        message.header.set_message_id(message_id);
        message.set_token(token.to_vec());
        message
    }

    #[test]
    fn test_token_in_use() {
        let mut matcher = ExchangeMatcher::new();
        matcher.register(peer(1), vec![0x7A], "a").unwrap();
        assert!(matches!(
            matcher.register(peer(1), vec![0x7A], "b"),
            Err(CoapError::TokenInUse { .. })
        ));
        // same token towards another peer is fine
        matcher.register(peer(2), vec![0x7A], "c").unwrap();
        assert_eq!(matcher.len(), 2);
    }

    #[test]
    fn test_match_by_token_and_peer() {
        let mut matcher = ExchangeMatcher::new();
        let a = matcher.register(peer(1), vec![0x7A], "a").unwrap();
        matcher.register(peer(1), vec![0x7B], "b").unwrap();

        let separate = response(MessageType::Confirmable, 900, &[0x7A]);
        assert_eq!(matcher.match_message(peer(1), &separate), Some((a, &"a")));
        assert_eq!(matcher.match_message(peer(2), &separate), None);

        let unknown = response(MessageType::NonConfirmable, 901, &[0x01]);
        assert_eq!(matcher.match_message(peer(1), &unknown), None);
    }

    #[test]
    fn test_piggybacked_requires_message_id() {
        let mut matcher = ExchangeMatcher::new();
        let a = matcher.register(peer(1), vec![0x7A], "a").unwrap();
        matcher.bind_message_id(a, 10);

        let stale = response(MessageType::Acknowledgement, 9, &[0x7A]);
        assert_eq!(matcher.match_message(peer(1), &stale), None);
        let piggybacked = response(MessageType::Acknowledgement, 10, &[0x7A]);
        assert_eq!(matcher.match_message(peer(1), &piggybacked), Some((a, &"a")));
    }

    #[test]
    fn test_empty_ack_and_reset_by_message_id() {
        let mut matcher = ExchangeMatcher::new();
        let a = matcher.register(peer(1), vec![0x7A], "a").unwrap();
        matcher.bind_message_id(a, 10);
        let t = matcher.register_transmission(peer(1), 11, "t");

        assert_eq!(matcher.match_message(peer(1), &Message::new_ack(10)), Some((a, &"a")));
        assert_eq!(matcher.match_message(peer(1), &Message::new_reset(11)), Some((t, &"t")));
        assert_eq!(matcher.match_message(peer(1), &Message::new_ack(12)), None);

        // rebinding forgets the previous transmission
        matcher.bind_message_id(a, 13);
        assert_eq!(matcher.match_message(peer(1), &Message::new_ack(10)), None);
        assert_eq!(matcher.match_message(peer(1), &Message::new_ack(13)), Some((a, &"a")));
    }

    #[test]
    fn test_requests_never_match() {
        let mut matcher = ExchangeMatcher::new();
        matcher.register(peer(1), vec![0x7A], "a").unwrap();
        let mut request = Message::new_request(RequestType::Get, MessageType::Confirmable);
        request.set_token(vec![0x7A]);
        assert_eq!(matcher.match_message(peer(1), &request), None);
    }

    #[test]
    fn test_remove_releases_indices() {
        let mut matcher = ExchangeMatcher::new();
        let a = matcher.register(peer(1), vec![0x7A], "a").unwrap();
        matcher.bind_message_id(a, 10);

        assert_eq!(matcher.remove(a), Some("a"));
        assert!(matcher.is_empty());
        assert!(!matcher.is_token_in_use(peer(1), &[0x7A]));
        assert_eq!(matcher.match_message(peer(1), &Message::new_ack(10)), None);
        assert!(matcher.register(peer(1), vec![0x7A], "again").is_ok());
    }
}

//! Server side of block-wise transfers: large response bodies are kept
//! between BLOCK2 requests and BLOCK1 uploads are assembled per request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::block::{block_slice, BlockAssembler, BlockValue};
use crate::error::BlockSequenceError;
use crate::message::{CoapOption, Message, RequestType};

/// Identifies "the same request" across the messages of a transfer.
///
/// Follow-up blocks carry new message IDs and possibly new tokens, so the
/// cache is keyed on what stays constant: peer, method and target URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestCacheKey {
    peer: SocketAddr,
    method: RequestType,
    uri: String,
}

impl RequestCacheKey {
    pub fn from_request(peer: SocketAddr, request: &Message) -> Option<RequestCacheKey> {
        let method = request.get_method()?;
        let mut uri = request.get_path();
        if let Some(queries) = request.get_option(CoapOption::UriQuery) {
            for (i, query) in queries.iter().enumerate() {
                uri.push(if i == 0 { '?' } else { '&' });
                uri.push_str(&String::from_utf8_lossy(query));
            }
        }
        Some(RequestCacheKey { peer, method, uri })
    }
}

#[derive(Debug)]
struct BlockState {
    touched_at: Instant,
    /// Complete response, payload is the whole body.
    response: Option<Message>,
    upload: Option<BlockAssembler>,
}

impl BlockState {
    fn new(now: Instant) -> BlockState {
        BlockState {
            touched_at: now,
            response: None,
            upload: None,
        }
    }
}

#[derive(Debug)]
pub struct BlockCache {
    lifetime: Duration,
    max_body_size: usize,
    entries: HashMap<RequestCacheKey, BlockState>,
}

impl BlockCache {
    pub fn new(lifetime: Duration, max_body_size: usize) -> BlockCache {
        BlockCache {
            lifetime,
            max_body_size,
            entries: HashMap::new(),
        }
    }

    /// Stores a response whose body will be served in blocks.
    pub fn cache_response(&mut self, key: RequestCacheKey, response: Message, now: Instant) {
        self.purge(now);
        let state = self
            .entries
            .entry(key)
            .or_insert_with(|| BlockState::new(now));
        state.touched_at = now;
        state.response = Some(response);
    }

    /// Builds the response for block `block.num` of a cached body.
    ///
    /// Returns `None` when nothing is cached for the key or the block is
    /// past the end of the body.
    pub fn serve(
        &mut self,
        key: &RequestCacheKey,
        block: BlockValue,
        now: Instant,
    ) -> Option<Message> {
        self.purge(now);
        let state = self.entries.get_mut(key)?;
        let cached = state.response.as_ref()?;
        let (value, chunk) = block_slice(&cached.payload, block.num, block.size_exponent)?;

        let mut response = Message::new();
        response.header = cached.header;
        *response.options_mut() = cached.options().clone();
        response.set_payload(chunk.to_vec());
        response.set_block2(value);

        state.touched_at = now;
        if !value.more {
            debug!("served last block {} of {:?}", value.num, key);
            state.response = None;
            if state.upload.is_none() {
                self.entries.remove(key);
            }
        }
        Some(response)
    }

    /// Adds a BLOCK1 block. Returns the whole body with the last block.
    /// A sequence error drops the partial upload.
    pub fn push_block(
        &mut self,
        key: &RequestCacheKey,
        block: BlockValue,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, BlockSequenceError> {
        self.purge(now);
        if block.num == 0 {
            // a new upload to the same resource supersedes an unfinished one
            if let Some(state) = self.entries.get_mut(key) {
                state.upload = None;
            }
        }

        let max_body_size = self.max_body_size;
        let state = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| BlockState::new(now));
        state.touched_at = now;
        let assembler = state
            .upload
            .get_or_insert_with(|| BlockAssembler::new(max_body_size));

        let result = assembler.push(block, payload);
        if !matches!(result, Ok(None)) {
            state.upload = None;
            if state.response.is_none() {
                self.entries.remove(key);
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, state| now.saturating_duration_since(state.touched_at) < lifetime);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageType, ResponseType};

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5683))
    }

    fn get(path: &str) -> Message {
        let mut request = Message::new_request(RequestType::Get, MessageType::Confirmable);
        request.set_path(path);
        request
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_key_includes_query() {
        let mut a = get("sensors/temp");
        let b = get("sensors/temp");
        a.add_option(CoapOption::UriQuery, b"unit=c".to_vec());

        let key_a = RequestCacheKey::from_request(peer(), &a).unwrap();
        let key_b = RequestCacheKey::from_request(peer(), &b).unwrap();
        assert_ne!(key_a, key_b);
        assert_eq!(key_a.uri, "sensors/temp?unit=c");
        assert!(RequestCacheKey::from_request(peer(), &Message::new_ack(1)).is_none());
    }

    #[test]
    fn test_serve_cached_blocks() {
        let now = Instant::now();
        let mut cache = BlockCache::new(Duration::from_secs(60), 1 << 20);
        let request = get("large");
        let key = RequestCacheKey::from_request(peer(), &request).unwrap();

        let mut response = Message::new_response(&request, ResponseType::Content);
        response.set_payload(body(300));
        cache.cache_response(key.clone(), response, now);

        let mut received = Vec::new();
        for num in 1..5 {
            let block = BlockValue::new(num, false, 2).unwrap();
            let served = cache.serve(&key, block, now).unwrap();
            let value = served.get_block2().unwrap().unwrap();
            assert_eq!(value.num, num);
            assert_eq!(value.more, num < 4);
            assert_eq!(served.get_status(), Some(ResponseType::Content));
            received.extend_from_slice(&served.payload);
        }
        assert_eq!(received, body(300)[64..].to_vec());
        // the last block releases the entry
        assert!(cache.is_empty());
        assert!(cache.serve(&key, BlockValue::new(1, false, 2).unwrap(), now).is_none());
    }

    #[test]
    fn test_cached_response_expires() {
        let now = Instant::now();
        let mut cache = BlockCache::new(Duration::from_secs(60), 1 << 20);
        let request = get("large");
        let key = RequestCacheKey::from_request(peer(), &request).unwrap();

        let mut response = Message::new_response(&request, ResponseType::Content);
        response.set_payload(body(300));
        cache.cache_response(key.clone(), response, now);

        let later = now + Duration::from_secs(61);
        assert!(cache.serve(&key, BlockValue::new(1, false, 2).unwrap(), later).is_none());
    }

    #[test]
    fn test_upload() {
        let now = Instant::now();
        let mut cache = BlockCache::new(Duration::from_secs(60), 1 << 20);
        let mut request = Message::new_request(RequestType::Put, MessageType::Confirmable);
        request.set_path("firmware");
        let key = RequestCacheKey::from_request(peer(), &request).unwrap();
        let payload = body(100);

        let first = BlockValue::new(0, true, 2).unwrap();
        assert_eq!(cache.push_block(&key, first, &payload[..64], now), Ok(None));
        let last = BlockValue::new(1, false, 2).unwrap();
        assert_eq!(cache.push_block(&key, last, &payload[64..], now), Ok(Some(payload)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_upload_out_of_order_aborts() {
        let now = Instant::now();
        let mut cache = BlockCache::new(Duration::from_secs(60), 1 << 20);
        let mut request = Message::new_request(RequestType::Put, MessageType::Confirmable);
        request.set_path("firmware");
        let key = RequestCacheKey::from_request(peer(), &request).unwrap();

        let first = BlockValue::new(0, true, 2).unwrap();
        assert_eq!(cache.push_block(&key, first, &[0; 64], now), Ok(None));
        let skipped = BlockValue::new(2, true, 2).unwrap();
        assert_eq!(
            cache.push_block(&key, skipped, &[0; 64], now),
            Err(BlockSequenceError::OutOfOrder {
                expected: 1,
                got: 2
            })
        );
        assert!(cache.is_empty());
    }
}

//! Requests delivered to the application and the handles used to answer
//! them.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::block::BlockValue;
use crate::block_transfer::RequestCacheKey;
use crate::message::{Message, ObserveOption, RequestType};
use crate::observer::ObserveRelation;

/// Everything needed to answer one inbound request.
///
/// Cloning the handle shares the acknowledgement state, so a request is
/// acknowledged at most once no matter which clone answers it.
#[derive(Debug, Clone)]
pub struct ResponseHandle {
    pub(crate) peer: SocketAddr,
    pub(crate) message_id: u16,
    pub(crate) token: Vec<u8>,
    pub(crate) confirmable: bool,
    pub(crate) acknowledged: Arc<AtomicBool>,
    pub(crate) observe: bool,
    pub(crate) path: String,
    /// BLOCK1 of the last block of an assembled upload, echoed in the response.
    pub(crate) block1: Option<BlockValue>,
    /// BLOCK2 the client asked for.
    pub(crate) block2: Option<BlockValue>,
    pub(crate) cache_key: Option<RequestCacheKey>,
}

impl ResponseHandle {
    pub(crate) fn new(
        peer: SocketAddr,
        message_id: u16,
        token: Vec<u8>,
        confirmable: bool,
    ) -> ResponseHandle {
        ResponseHandle {
            peer,
            message_id,
            token,
            confirmable,
            acknowledged: Arc::new(AtomicBool::new(false)),
            observe: false,
            path: String::new(),
            block1: None,
            block2: None,
            cache_key: None,
        }
    }

    pub(crate) fn for_request(peer: SocketAddr, request: &Message) -> ResponseHandle {
        let mut handle = ResponseHandle::new(
            peer,
            request.header.get_message_id(),
            request.get_token().to_vec(),
            request.is_confirmable(),
        );
        handle.observe = request.get_method() == Some(RequestType::Get)
            && request.get_observe_flag() == Some(ObserveOption::Register);
        handle.path = request.get_path();
        handle.block2 = request.get_block2().ok().flatten();
        handle.cache_key = RequestCacheKey::from_request(peer, request);
        handle
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn is_confirmable(&self) -> bool {
        self.confirmable
    }

    /// Whether the request has been acknowledged, either by a piggybacked
    /// response or by an empty ACK.
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Marks the request acknowledged. Returns true for the caller that has
    /// to send the acknowledgement.
    pub(crate) fn take_acknowledgement(&self) -> bool {
        self.confirmable && !self.acknowledged.swap(true, Ordering::SeqCst)
    }

    /// The relation a GET with OBSERVE=0 asks for. It becomes active once a
    /// successful response has been sent through this handle.
    pub fn observe_relation(&self) -> Option<ObserveRelation> {
        if !self.observe {
            return None;
        }
        Some(ObserveRelation::new(self.peer, self.token.clone(), self.path.clone()))
    }
}

/// A request for the application, with the handle to answer it.
#[derive(Debug)]
pub struct IncomingRequest {
    pub message: Message,
    pub handle: ResponseHandle,
}

impl IncomingRequest {
    pub fn source(&self) -> SocketAddr {
        self.handle.peer
    }
}

/// Requests received by an [`Endpoint`](crate::Endpoint), in arrival order.
///
/// Block-wise uploads arrive once, fully assembled. Duplicates and
/// follow-up blocks of cached responses never show up here.
#[derive(Debug)]
pub struct IncomingRequests {
    inner: ReceiverStream<IncomingRequest>,
}

impl IncomingRequests {
    pub(crate) fn new(receiver: mpsc::Receiver<IncomingRequest>) -> IncomingRequests {
        IncomingRequests {
            inner: ReceiverStream::new(receiver),
        }
    }

    /// The next request, or `None` once the endpoint is gone.
    pub async fn recv(&mut self) -> Option<IncomingRequest> {
        self.inner.next().await
    }
}

impl Stream for IncomingRequests {
    type Item = IncomingRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<IncomingRequest>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::MessageType;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 5683))
    }

    #[test]
    fn test_acknowledged_once() {
        let mut request = Message::new_request(RequestType::Get, MessageType::Confirmable);
        request.header.set_message_id(7);
        let handle = ResponseHandle::for_request(peer(), &request);
        let clone = handle.clone();

        assert!(!handle.is_acknowledged());
        assert!(clone.take_acknowledgement());
        assert!(!handle.take_acknowledgement());
        assert!(handle.is_acknowledged());
    }

    #[test]
    fn test_non_confirmable_needs_no_acknowledgement() {
        let request = Message::new_request(RequestType::Post, MessageType::NonConfirmable);
        let handle = ResponseHandle::for_request(peer(), &request);
        assert!(!handle.take_acknowledgement());
    }

    #[test]
    fn test_observe_relation() {
        let mut request = Message::new_request(RequestType::Get, MessageType::Confirmable);
        request.set_path("sensors/temp");
        request.set_token(vec![0x7A]);
        assert!(ResponseHandle::for_request(peer(), &request).observe_relation().is_none());

        request.set_observe_value(ObserveOption::Register as u32);
        let relation = ResponseHandle::for_request(peer(), &request)
            .observe_relation()
            .unwrap();
        assert_eq!(relation.path(), "sensors/temp");
        assert_eq!(relation.token(), &[0x7A]);
        assert_eq!(relation.peer(), peer());
    }
}

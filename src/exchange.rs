//! Per-exchange tasks.
//!
//! Every outstanding exchange owns the receiving half of a channel that the
//! inbound path feeds through the [`ExchangeMatcher`]. The task drives its
//! own timers and releases its matcher entry when it is dropped, whether it
//! finished, failed or was cancelled.
//!
//! [`ExchangeMatcher`]: crate::matcher::ExchangeMatcher

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use crate::block::{BlockAssembler, BlockValue, Fragmenter};
use crate::endpoint::Inner;
use crate::error::CoapError;
use crate::matcher::ExchangeId;
use crate::message::header::class_to_code;
use crate::message::{hex, CoapOption, Message, MessageClass, MessageType, ResponseType};
use crate::observer::Freshness;
use crate::retransmit::{RetransmissionContext, TimeoutAction};

pub(crate) type ExchangeReceiver = mpsc::UnboundedReceiver<Message>;

/// Releases a matcher entry on drop.
struct Registration {
    inner: Arc<Inner>,
    id: ExchangeId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.inner.lock().matcher.remove(self.id);
    }
}

/// Sends `bytes` and retransmits them until the peer acknowledges.
///
/// Returns the piggybacked response if the acknowledgement carried one.
async fn transmit_reliably(
    inner: &Inner,
    peer: SocketAddr,
    message_id: u16,
    bytes: &[u8],
    events: &mut ExchangeReceiver,
) -> Result<Option<Message>, CoapError> {
    inner.send_bytes(bytes, peer).await?;

    let mut retransmission = RetransmissionContext::new(&inner.config);
    let timer = time::sleep(retransmission.timeout());
    tokio::pin!(timer);

    loop {
        tokio::select! {
            event = events.recv() => {
                let message = event.ok_or(CoapError::Closed)?;
                if is_stale(&message, message_id) {
                    continue;
                }
                match (message.header.get_type(), message.header.code) {
                    (MessageType::Reset, _) => {
                        retransmission.reset();
                        debug!("reset by {}", peer);
                        return Err(CoapError::Reset);
                    }
                    (MessageType::Acknowledgement, MessageClass::Empty) => {
                        retransmission.acknowledge();
                        return Ok(None);
                    }
                    (_, MessageClass::Response(_)) => {
                        // a separate response implies the acknowledgement got lost
                        retransmission.acknowledge();
                        return Ok(Some(message));
                    }
                    _ => {}
                }
            }
            _ = &mut timer => {
                match retransmission.on_timeout() {
                    TimeoutAction::Retransmit => {
                        debug!(
                            "retransmission {} to {}, next timeout {:?}",
                            retransmission.transmissions() - 1,
                            peer,
                            retransmission.timeout()
                        );
                        inner.send_bytes(bytes, peer).await?;
                        timer.as_mut().reset(Instant::now() + retransmission.timeout());
                    }
                    TimeoutAction::Exhausted => {
                        warn!(
                            "no acknowledgement from {} after {} transmissions",
                            peer,
                            retransmission.transmissions()
                        );
                        return Err(CoapError::TimedOut {
                            attempts: retransmission.transmissions(),
                        });
                    }
                    TimeoutAction::Ignore => return Ok(None),
                }
            }
        }
    }
}

/// Waits up to `timeout` for a response on an exchange that needs no
/// further transmissions.
async fn await_response(
    events: &mut ExchangeReceiver,
    message_id: u16,
    timeout: Duration,
) -> Result<Message, CoapError> {
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => {
                let message = event.ok_or(CoapError::Closed)?;
                if is_stale(&message, message_id) {
                    continue;
                }
                match message.header.code {
                    MessageClass::Response(_) => return Ok(message),
                    _ if message.header.get_type() == MessageType::Reset => {
                        return Err(CoapError::Reset)
                    }
                    _ => {}
                }
            }
            _ = &mut deadline => return Err(CoapError::LifetimeExpired),
        }
    }
}

/// ACK and RST answer one transmission. Those for an earlier round of the
/// exchange, such as a resent piggybacked response, are dropped.
fn is_stale(message: &Message, message_id: u16) -> bool {
    let stale = matches!(
        message.header.get_type(),
        MessageType::Acknowledgement | MessageType::Reset
    ) && message.header.get_message_id() != message_id;
    if stale {
        debug!(
            "dropping late {:?} {}, waiting for {}",
            message.header.get_type(),
            message.header.get_message_id(),
            message_id
        );
    }
    stale
}

/// Sends a token-less confirmable message, such as a separate response or
/// a notification, and waits for its acknowledgement.
pub(crate) async fn transmit_confirmable(
    inner: &Arc<Inner>,
    peer: SocketAddr,
    message: &Message,
) -> Result<(), CoapError> {
    let bytes = message.to_bytes()?;
    let (sender, mut events) = mpsc::unbounded_channel();
    let id = inner
        .lock()
        .matcher
        .register_transmission(peer, message.header.get_message_id(), sender);
    let _registration = Registration {
        inner: inner.clone(),
        id,
    };

    let message_id = message.header.get_message_id();
    transmit_reliably(inner, peer, message_id, &bytes, &mut events).await?;
    Ok(())
}

/// The client side of one request/response exchange.
pub(crate) struct ClientExchange {
    registration: Registration,
    peer: SocketAddr,
    token: Vec<u8>,
    events: ExchangeReceiver,
}

impl ClientExchange {
    pub(crate) fn new(
        inner: Arc<Inner>,
        id: ExchangeId,
        peer: SocketAddr,
        token: Vec<u8>,
        events: ExchangeReceiver,
    ) -> ClientExchange {
        ClientExchange {
            registration: Registration { inner, id },
            peer,
            token,
            events,
        }
    }

    fn inner(&self) -> &Arc<Inner> {
        &self.registration.inner
    }

    /// Runs the whole exchange: uploads the body block-wise if it does not
    /// fit into one message, then fetches the remaining blocks of the
    /// response.
    pub(crate) async fn run(mut self, mut request: Message) -> Result<Message, CoapError> {
        let block_size = match request.get_block1()? {
            Some(preferred) => preferred.size(),
            None => self.inner().config.block_size(),
        };
        let response = if request.payload.len() > block_size {
            self.upload(&mut request).await?
        } else {
            self.round(&mut request).await?
        };
        self.download(request, response).await
    }

    /// One message and its response. Every round uses a fresh message ID
    /// and the exchange's token.
    pub(crate) async fn round(&mut self, request: &mut Message) -> Result<Message, CoapError> {
        let inner = self.inner().clone();
        let message_id = inner.next_message_id();
        request.header.set_message_id(message_id);
        inner
            .lock()
            .matcher
            .bind_message_id(self.registration.id, message_id);

        let bytes = request.to_bytes()?;
        if !request.is_confirmable() {
            inner.send_bytes(&bytes, self.peer).await?;
            return await_response(&mut self.events, message_id, inner.config.non_lifetime).await;
        }

        match transmit_reliably(&inner, self.peer, message_id, &bytes, &mut self.events).await? {
            Some(response) => Ok(response),
            None => {
                debug!(
                    "request {} acknowledged, waiting for separate response",
                    hex(&self.token)
                );
                await_response(&mut self.events, message_id, inner.config.exchange_lifetime).await
            }
        }
    }

    async fn upload(&mut self, request: &mut Message) -> Result<Message, CoapError> {
        let size_exponent = match request.get_block1()? {
            Some(preferred) => preferred.size_exponent,
            None => self.inner().config.block_size_exponent,
        };
        request.clear_option(CoapOption::Block1);
        let mut fragmenter = Fragmenter::new(std::mem::take(&mut request.payload), size_exponent);

        loop {
            let (block, chunk) = fragmenter.current();
            let mut message = request.clone();
            message.set_payload(chunk.to_vec());
            message.set_block1(block);

            let response = self.round(&mut message).await?;
            if !block.more {
                return Ok(response);
            }
            if response.get_status() != Some(ResponseType::Continue) {
                debug!(
                    "upload {} stopped after block {} with {}",
                    hex(&self.token),
                    block.num,
                    response.header.get_code()
                );
                return Ok(response);
            }
            fragmenter.advance();
            if let Some(acknowledged) = response.get_block1()? {
                fragmenter.renegotiate(acknowledged.size_exponent);
            }
        }
    }

    async fn download(
        &mut self,
        mut request: Message,
        first: Message,
    ) -> Result<Message, CoapError> {
        let mut response = first;
        let mut assembler: Option<BlockAssembler> = None;

        loop {
            let Some(block) = response.get_block2()? else {
                return Ok(response);
            };
            if block.num == 0 && !block.more {
                return Ok(response);
            }

            let max_body_size = self.inner().config.max_body_size;
            let body = assembler
                .get_or_insert_with(|| BlockAssembler::new(max_body_size))
                .push(block, &response.payload)?;
            if let Some(body) = body {
                debug!(
                    "reassembled {} bytes for {}",
                    body.len(),
                    hex(&self.token)
                );
                response.set_payload(body);
                response.clear_option(CoapOption::Block2);
                return Ok(response);
            }

            request.set_payload(Vec::new());
            request.clear_option(CoapOption::Block1);
            request.set_block2(BlockValue::new(block.num + 1, false, block.size_exponent)?);
            response = self.round(&mut request).await?;
        }
    }

    /// Forwards notifications until the relation ends or `stream` is
    /// dropped. `first_sequence` is the OBSERVE value of the registration
    /// response, which has already been delivered.
    pub(crate) async fn follow(mut self, first_sequence: u32, stream: mpsc::Sender<Message>) {
        let mut freshness = Freshness::default();
        freshness.accept(first_sequence, Instant::now());

        loop {
            tokio::select! {
                _ = stream.closed() => {
                    debug!("observation {} dropped by the application", hex(&self.token));
                    return;
                }
                event = self.events.recv() => {
                    let Some(notification) = event else {
                        return;
                    };
                    if !notification.is_response() {
                        continue;
                    }
                    let sequence = notification.get_observe_value();
                    if let Some(sequence) = sequence {
                        if !freshness.accept(sequence, Instant::now()) {
                            debug!(
                                "dropping stale notification {} for {}",
                                sequence,
                                hex(&self.token)
                            );
                            continue;
                        }
                    }
                    let last = sequence.is_none() || !is_success(&notification);
                    if stream.send(notification).await.is_err() || last {
                        return;
                    }
                }
            }
        }
    }
}

/// Completion of a request sent with
/// [`Endpoint::send_request`](crate::Endpoint::send_request).
///
/// Dropping it cancels the exchange: retransmissions stop and a late
/// response is treated as unmatched.
#[derive(Debug)]
pub struct PendingRequest {
    token: Vec<u8>,
    receiver: oneshot::Receiver<Result<Message, CoapError>>,
}

impl PendingRequest {
    pub(crate) fn spawn(exchange: ClientExchange, request: Message) -> PendingRequest {
        let token = exchange.token.clone();
        let (done, receiver) = oneshot::channel();
        tokio::spawn(async move {
            let mut done = done;
            let token = exchange.token.clone();
            tokio::select! {
                _ = done.closed() => {
                    debug!("exchange {} cancelled", hex(&token));
                }
                result = exchange.run(request) => {
                    let _ = done.send(result);
                }
            }
        });
        PendingRequest { token, receiver }
    }

    /// The token the request was sent with.
    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

impl Future for PendingRequest {
    type Output = Result<Message, CoapError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CoapError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// 2.xx response codes.
pub(crate) fn is_success(message: &Message) -> bool {
    matches!(message.header.code, MessageClass::Response(_))
        && class_to_code(&message.header.code) >> 5 == 2
}

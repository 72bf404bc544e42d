use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace, warn};
use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::block::{block_slice, BlockValue};
use crate::block_transfer::BlockCache;
use crate::config::EngineConfig;
use crate::dedup::{DedupCache, Observation};
use crate::error::{BadOption, CoapError, DecodeError};
use crate::exchange::{self, is_success, ClientExchange, PendingRequest};
use crate::matcher::ExchangeMatcher;
use crate::message::{
    hex, CoapOption, Message, MessageClass, MessageType, ObserveOption, RequestType, ResponseType,
};
use crate::observer::{ObserveRegistry, ObserveRelation, ObserveStream};
use crate::server::{IncomingRequest, IncomingRequests, ResponseHandle};
use crate::transport::Transport;

pub(crate) type ExchangeSender = mpsc::UnboundedSender<Message>;

/// State shared between the inbound path and the exchange tasks.
pub(crate) struct Shared {
    pub(crate) dedup: DedupCache,
    pub(crate) matcher: ExchangeMatcher<ExchangeSender>,
    pub(crate) blocks: BlockCache,
    pub(crate) observers: ObserveRegistry,
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: EngineConfig,
    shared: Mutex<Shared>,
    message_id: AtomicU16,
    requests: mpsc::Sender<IncomingRequest>,
    shutdown: CancellationToken,
}

impl Inner {
    /// Never hold the guard across an `.await`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_message_id(&self) -> u16 {
        self.message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn send_bytes(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), CoapError> {
        trace!("sending {} bytes to {}", bytes.len(), peer);
        self.transport.send_to(bytes, peer).await?;
        Ok(())
    }
}

/// A CoAP endpoint: client and server on one transport.
///
/// The endpoint is a cheap handle, clones share the same state. Nothing
/// happens on the wire for inbound traffic until [`listen`](Endpoint::listen)
/// is called or datagrams are fed through
/// [`handle_datagram`](Endpoint::handle_datagram).
///
/// ```no_run
/// use std::sync::Arc;
/// use coap_engine::{Endpoint, EngineConfig, Message, RequestType, MessageType, UdpTransport};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = UdpTransport::bind("0.0.0.0:0").await?;
/// let (endpoint, _requests) = Endpoint::new(Arc::new(transport), EngineConfig::default());
/// endpoint.listen();
///
/// let mut request = Message::new_request(RequestType::Get, MessageType::Confirmable);
/// request.set_path("sensors/temp");
/// let response = endpoint.request("192.0.2.1:5683".parse()?, request).await?;
/// println!("{}", String::from_utf8_lossy(&response.payload));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> (Endpoint, IncomingRequests) {
        let (requests, receiver) = mpsc::channel(config.request_queue.max(1));
        let shared = Shared {
            dedup: DedupCache::new(config.exchange_lifetime),
            matcher: ExchangeMatcher::new(),
            blocks: BlockCache::new(config.exchange_lifetime, config.max_body_size),
            observers: ObserveRegistry::new(),
        };
        let inner = Inner {
            transport,
            config,
            shared: Mutex::new(shared),
            message_id: AtomicU16::new(rand::random()),
            requests,
            shutdown: CancellationToken::new(),
        };
        (
            Endpoint {
                inner: Arc::new(inner),
            },
            IncomingRequests::new(receiver),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Spawns the receive loop. It ends with [`close`](Endpoint::close) or
    /// the first transport error.
    pub fn listen(&self) -> JoinHandle<Result<(), CoapError>> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; endpoint.inner.config.max_message_size];
            debug!("receive loop started");
            loop {
                let received = tokio::select! {
                    _ = endpoint.inner.shutdown.cancelled() => {
                        debug!("receive loop stopped");
                        return Ok(());
                    }
                    received = endpoint.inner.transport.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((n, peer)) => endpoint.handle_datagram(peer, &buf[..n]).await,
                    Err(e) => {
                        error!("receiving failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
        })
    }

    /// Stops the receive loop and fails every outstanding exchange with
    /// [`CoapError::Closed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let exchanges = self.inner.lock().matcher.drain();
        debug!("closed with {} outstanding exchanges", exchanges.len());
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Starts an exchange. Errors that can be detected before anything is
    /// sent are returned here, everything else through the
    /// [`PendingRequest`].
    ///
    /// An empty token is replaced with a random one. The message ID is
    /// always assigned by the endpoint. Must be called from within a tokio
    /// runtime.
    pub fn send_request(
        &self,
        peer: SocketAddr,
        request: Message,
    ) -> Result<PendingRequest, CoapError> {
        let (exchange, request) = self.start_exchange(peer, request)?;
        Ok(PendingRequest::spawn(exchange, request))
    }

    /// Sends a request and waits for its response.
    pub async fn request(&self, peer: SocketAddr, request: Message) -> Result<Message, CoapError> {
        self.send_request(peer, request)?.await
    }

    /// Sends a message as NON and returns once it has been handed to the
    /// transport. Nothing is retransmitted and no response is awaited.
    pub async fn send_non(&self, peer: SocketAddr, mut message: Message) -> Result<(), CoapError> {
        if self.is_closed() {
            return Err(CoapError::Closed);
        }
        message.header.set_type(MessageType::NonConfirmable);
        message
            .header
            .set_message_id(self.inner.next_message_id());
        if message.is_request() && message.get_token().is_empty() {
            message.set_token(random_token(self.inner.config.token_length));
        }
        let bytes = message.to_bytes()?;
        self.inner.send_bytes(&bytes, peer).await
    }

    /// Registers interest in a resource. The returned stream yields the
    /// registration response first, then the notifications.
    pub async fn observe(
        &self,
        peer: SocketAddr,
        mut request: Message,
    ) -> Result<ObserveStream, CoapError> {
        request.set_observe_value(ObserveOption::Register as u32);
        let (mut exchange, mut request) = self.start_exchange(peer, request)?;
        let token = request.get_token().to_vec();

        let first = exchange.round(&mut request).await?;
        let (sender, receiver) = mpsc::channel(8);
        let sequence = first.get_observe_value().filter(|_| is_success(&first));
        // the receiver is alive, the channel has room for the first message
        let _ = sender.try_send(first);
        match sequence {
            Some(sequence) => {
                debug!("observing {} with token {}", request.get_path(), hex(&token));
                tokio::spawn(exchange.follow(sequence, sender));
            }
            None => debug!("{} is not observable", request.get_path()),
        }
        Ok(ObserveStream::new(token, receiver))
    }

    /// Answers a request.
    ///
    /// The response is piggybacked on the acknowledgement if the request is
    /// confirmable and has not been acknowledged yet, otherwise it goes out
    /// as a separate response (CON unless the response is marked NON, and
    /// retransmitted until acknowledged). Bodies larger than the block size
    /// are served block-wise.
    pub async fn send_response(
        &self,
        handle: &ResponseHandle,
        mut response: Message,
    ) -> Result<(), CoapError> {
        if handle.observe {
            let mut shared = self.inner.lock();
            if is_success(&response) {
                if let Some(relation) = handle.observe_relation() {
                    let sequence = shared.observers.register(&relation);
                    response.set_observe_value(sequence);
                }
            } else {
                shared.observers.deregister(handle.peer, &handle.token);
            }
        }

        if let Some(block) = handle.block1 {
            response.set_block1(BlockValue {
                more: false,
                ..block
            });
        }

        let size_exponent = handle
            .block2
            .map(|block| block.size_exponent)
            .unwrap_or(self.inner.config.block_size_exponent)
            .min(self.inner.config.block_size_exponent);
        let requested = handle.block2.map(|block| block.num).unwrap_or(0);
        if response.payload.len() > 1 << (size_exponent + 4) || requested > 0 {
            match block_slice(&response.payload, requested, size_exponent) {
                Some((block, chunk)) => {
                    let chunk = chunk.to_vec();
                    if block.more {
                        if let Some(key) = &handle.cache_key {
                            self.inner
                                .lock()
                                .blocks
                                .cache_response(key.clone(), response.clone(), Instant::now());
                        }
                    }
                    response.set_payload(chunk);
                    response.set_block2(block);
                }
                None => {
                    debug!("block {} is past the end of the body", requested);
                    response = status_response(handle, ResponseType::BadOption);
                }
            }
        }

        self.transmit_response(handle, response).await
    }

    /// Acknowledges a confirmable request with an empty ACK, so the
    /// response can follow separately.
    pub async fn accept(&self, handle: &ResponseHandle) -> Result<(), CoapError> {
        if !handle.take_acknowledgement() {
            return Ok(());
        }
        let bytes = Message::new_ack(handle.message_id).to_bytes()?;
        self.inner
            .lock()
            .dedup
            .set_reply(handle.peer, handle.message_id, bytes.clone());
        self.inner.send_bytes(&bytes, handle.peer).await
    }

    /// Sends a notification to an observer.
    ///
    /// Fails with [`CoapError::Cancelled`] once the relation has ended. A
    /// reset or a confirmable notification that is never acknowledged ends
    /// the relation.
    pub async fn notify(
        &self,
        relation: &ObserveRelation,
        mut notification: Message,
        confirmable: bool,
    ) -> Result<(), CoapError> {
        if !notification.is_response() {
            notification.header.code = MessageClass::Response(ResponseType::Content);
        }
        let message_id = self.inner.next_message_id();
        let sequence = {
            let mut shared = self.inner.lock();
            let sequence = shared
                .observers
                .next_sequence(relation)
                .ok_or(CoapError::Cancelled)?;
            shared.observers.record_message_id(relation, message_id);
            sequence
        };

        notification.set_token(relation.token().to_vec());
        notification.set_observe_value(sequence);
        notification.header.set_message_id(message_id);
        let last = !is_success(&notification);

        let result = if confirmable {
            notification.header.set_type(MessageType::Confirmable);
            exchange::transmit_confirmable(&self.inner, relation.peer(), &notification).await
        } else {
            notification.header.set_type(MessageType::NonConfirmable);
            let bytes = notification.to_bytes()?;
            self.inner.send_bytes(&bytes, relation.peer()).await
        };

        if last || matches!(result, Err(CoapError::TimedOut { .. }) | Err(CoapError::Reset)) {
            self.inner
                .lock()
                .observers
                .deregister(relation.peer(), relation.token());
        }
        result
    }

    /// Active observe relations on `path`.
    pub fn observers(&self, path: &str) -> Vec<ObserveRelation> {
        self.inner.lock().observers.relations(path)
    }

    /// Processes one inbound datagram.
    pub async fn handle_datagram(&self, peer: SocketAddr, datagram: &[u8]) {
        trace!("received {} bytes from {}", datagram.len(), peer);
        let message = match Message::from_bytes(datagram) {
            Ok(message) => message,
            Err(DecodeError::Format(e)) => {
                debug!("dropping datagram from {}: {}", peer, e);
                return;
            }
            Err(DecodeError::BadOption(bad)) => {
                self.reject_bad_option(peer, bad).await;
                return;
            }
        };

        match message.header.code {
            MessageClass::Empty => self.handle_empty(peer, message).await,
            MessageClass::Request(_) => self.handle_request(peer, message).await,
            MessageClass::Response(_) => self.handle_response(peer, message).await,
        }
    }

    fn start_exchange(
        &self,
        peer: SocketAddr,
        mut request: Message,
    ) -> Result<(ClientExchange, Message), CoapError> {
        if self.is_closed() {
            return Err(CoapError::Closed);
        }
        if request.header.get_type() != MessageType::NonConfirmable {
            request.header.set_type(MessageType::Confirmable);
        }
        request.validate()?;

        let (sender, events) = mpsc::unbounded_channel();
        let id = {
            let mut shared = self.inner.lock();
            if request.get_token().is_empty() {
                loop {
                    let token = random_token(self.inner.config.token_length);
                    if !shared.matcher.is_token_in_use(peer, &token) {
                        request.set_token(token.clone());
                        break shared.matcher.register(peer, token, sender)?;
                    }
                }
            } else {
                shared
                    .matcher
                    .register(peer, request.get_token().to_vec(), sender)?
            }
        };
        debug!(
            "{} {} to {} with token {}",
            request.header.get_code(),
            request.get_path(),
            peer,
            hex(request.get_token())
        );

        let exchange = ClientExchange::new(
            self.inner.clone(),
            id,
            peer,
            request.get_token().to_vec(),
            events,
        );
        Ok((exchange, request))
    }

    async fn transmit_response(
        &self,
        handle: &ResponseHandle,
        mut response: Message,
    ) -> Result<(), CoapError> {
        response.set_token(handle.token.clone());
        if handle.take_acknowledgement() {
            response.header.set_type(MessageType::Acknowledgement);
            response.header.set_message_id(handle.message_id);
            let bytes = response.to_bytes()?;
            self.inner
                .lock()
                .dedup
                .set_reply(handle.peer, handle.message_id, bytes.clone());
            return self.inner.send_bytes(&bytes, handle.peer).await;
        }

        let confirmable = match response.header.get_type() {
            MessageType::Confirmable => true,
            MessageType::NonConfirmable => false,
            _ => handle.confirmable,
        };
        response
            .header
            .set_message_id(self.inner.next_message_id());
        if confirmable {
            response.header.set_type(MessageType::Confirmable);
            exchange::transmit_confirmable(&self.inner, handle.peer, &response).await
        } else {
            response.header.set_type(MessageType::NonConfirmable);
            let bytes = response.to_bytes()?;
            self.inner.send_bytes(&bytes, handle.peer).await
        }
    }

    /// Records a CON or NON message ID. Duplicates of a confirmable message
    /// are answered with the reply cached for the original.
    async fn is_duplicate(&self, peer: SocketAddr, message_id: u16, confirmable: bool) -> bool {
        let cached = {
            let mut shared = self.inner.lock();
            match shared.dedup.observe(peer, message_id, Instant::now()) {
                Observation::New => return false,
                Observation::Duplicate if confirmable => shared
                    .dedup
                    .cached_reply(peer, message_id)
                    .map(<[u8]>::to_vec),
                Observation::Duplicate => None,
            }
        };

        match cached {
            Some(bytes) => {
                debug!("duplicate {} from {}, resending reply", message_id, peer);
                if let Err(e) = self.inner.send_bytes(&bytes, peer).await {
                    warn!("resending reply to {} failed: {}", peer, e);
                }
            }
            None => debug!("dropping duplicate {} from {}", message_id, peer),
        }
        true
    }

    async fn reject_bad_option(&self, peer: SocketAddr, bad: BadOption) {
        debug!("{} from {}", bad, peer);
        let confirmable = bad.message_type == MessageType::Confirmable;

        if bad.is_request() {
            if !matches!(bad.message_type, MessageType::Confirmable | MessageType::NonConfirmable)
                || self.is_duplicate(peer, bad.message_id, confirmable).await
            {
                return;
            }
            let handle = ResponseHandle::new(peer, bad.message_id, bad.token, confirmable);
            let response = status_response(&handle, ResponseType::BadOption);
            self.reply(&handle, response).await;
        } else if matches!(bad.code, MessageClass::Response(_)) && confirmable {
            self.send_reset(peer, bad.message_id).await;
        }
    }

    async fn handle_empty(&self, peer: SocketAddr, message: Message) {
        let message_id = message.header.get_message_id();
        match message.header.get_type() {
            MessageType::Confirmable => {
                debug!("ping {} from {}", message_id, peer);
                self.send_reset(peer, message_id).await;
            }
            MessageType::NonConfirmable => debug!("dropping empty NON from {}", peer),
            message_type => {
                let sender = self
                    .inner
                    .lock()
                    .matcher
                    .match_message(peer, &message)
                    .map(|(_, sender)| sender.clone());
                match sender {
                    Some(sender) => {
                        let _ = sender.send(message);
                    }
                    None if message_type == MessageType::Reset => {
                        if self.inner.lock().observers.reset(peer, message_id) {
                            debug!("observer {} cancelled with reset {}", peer, message_id);
                        } else {
                            debug!("dropping unmatched reset {} from {}", message_id, peer);
                        }
                    }
                    None => debug!(
                        "dropping unmatched {:?} {} from {}",
                        message_type, message_id, peer
                    ),
                }
            }
        }
    }

    async fn handle_response(&self, peer: SocketAddr, message: Message) {
        let message_id = message.header.get_message_id();
        let message_type = message.header.get_type();
        let confirmable = message_type == MessageType::Confirmable;
        if matches!(message_type, MessageType::Confirmable | MessageType::NonConfirmable)
            && self.is_duplicate(peer, message_id, confirmable).await
        {
            return;
        }

        let sender = self
            .inner
            .lock()
            .matcher
            .match_message(peer, &message)
            .map(|(_, sender)| sender.clone());
        let Some(sender) = sender else {
            debug!(
                "dropping unmatched response {} with token {} from {}",
                message_id,
                hex(message.get_token()),
                peer
            );
            let observed_non = message_type == MessageType::NonConfirmable
                && message.get_observe_value().is_some();
            if confirmable || observed_non {
                self.send_reset(peer, message_id).await;
            }
            return;
        };

        if confirmable {
            match Message::new_ack(message_id).to_bytes() {
                Ok(bytes) => {
                    self.inner
                        .lock()
                        .dedup
                        .set_reply(peer, message_id, bytes.clone());
                    if let Err(e) = self.inner.send_bytes(&bytes, peer).await {
                        warn!("acknowledging {} to {} failed: {}", message_id, peer, e);
                    }
                }
                Err(e) => warn!("{}", e),
            }
        }
        let _ = sender.send(message);
    }

    async fn handle_request(&self, peer: SocketAddr, mut message: Message) {
        let message_id = message.header.get_message_id();
        let confirmable = match message.header.get_type() {
            MessageType::Confirmable => true,
            MessageType::NonConfirmable => false,
            message_type => {
                debug!("dropping request {} sent as {:?} by {}", message_id, message_type, peer);
                return;
            }
        };
        if self.is_duplicate(peer, message_id, confirmable).await {
            return;
        }

        let mut handle = ResponseHandle::for_request(peer, &message);
        if message.get_method() == Some(RequestType::Get) {
            match message.get_observe_flag() {
                Some(ObserveOption::Register) => {}
                _ => {
                    self.inner
                        .lock()
                        .observers
                        .deregister(peer, message.get_token());
                }
            }
        }

        let (block1, block2) = match (message.get_block1(), message.get_block2()) {
            (Ok(block1), Ok(block2)) => (block1, block2),
            (Err(e), _) | (_, Err(e)) => {
                debug!("invalid block option from {}: {}", peer, e);
                self.reply(&handle, status_response(&handle, ResponseType::BadOption))
                    .await;
                return;
            }
        };

        if let (Some(block), Some(key)) = (block2, handle.cache_key.as_ref()) {
            if block.num > 0 {
                let served = self.inner.lock().blocks.serve(key, block, Instant::now());
                if let Some(response) = served {
                    self.reply(&handle, response).await;
                    return;
                }
            }
        }

        if let (Some(block), Some(key)) = (block1, handle.cache_key.clone()) {
            let payload = std::mem::take(&mut message.payload);
            let pushed = self
                .inner
                .lock()
                .blocks
                .push_block(&key, block, &payload, Instant::now());
            match pushed {
                Ok(None) => {
                    let mut response = status_response(&handle, ResponseType::Continue);
                    response.set_block1(BlockValue {
                        size_exponent: block
                            .size_exponent
                            .min(self.inner.config.block_size_exponent),
                        ..block
                    });
                    self.reply(&handle, response).await;
                    return;
                }
                Ok(Some(body)) => {
                    debug!("assembled {} byte upload from {}", body.len(), peer);
                    message.set_payload(body);
                    message.clear_option(CoapOption::Block1);
                    handle.block1 = Some(block);
                }
                Err(e) => {
                    debug!("aborting upload from {}: {}", peer, e);
                    let response = status_response(&handle, ResponseType::RequestEntityIncomplete);
                    self.reply(&handle, response).await;
                    return;
                }
            }
        }

        let request = IncomingRequest {
            message,
            handle: handle.clone(),
        };
        match self.inner.requests.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("request queue full, rejecting {} from {}", message_id, peer);
                self.reply(&handle, status_response(&handle, ResponseType::ServiceUnavailable))
                    .await;
            }
            Err(TrySendError::Closed(_)) => {
                debug!("no one serves requests, resetting {} from {}", message_id, peer);
                if confirmable {
                    self.send_reset(peer, message_id).await;
                }
            }
        }
    }

    /// Sends a reply generated by the endpoint itself.
    async fn reply(&self, handle: &ResponseHandle, response: Message) {
        if let Err(e) = self.transmit_response(handle, response).await {
            warn!("replying to {} failed: {}", handle.peer, e);
        }
    }

    async fn send_reset(&self, peer: SocketAddr, message_id: u16) {
        let result = match Message::new_reset(message_id).to_bytes() {
            Ok(bytes) => {
                self.inner
                    .lock()
                    .dedup
                    .set_reply(peer, message_id, bytes.clone());
                self.inner.send_bytes(&bytes, peer).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("resetting {} to {} failed: {}", message_id, peer, e);
        }
    }
}

fn status_response(handle: &ResponseHandle, status: ResponseType) -> Message {
    let mut response = Message::new();
    response.header.set_type(MessageType::Acknowledgement);
    response.header.code = MessageClass::Response(status);
    response.set_token(handle.token.clone());
    response
}

fn random_token(length: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..length.clamp(1, 8)).map(|_| rng.gen()).collect()
}

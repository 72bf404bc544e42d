#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use coap_engine::{Endpoint, EngineConfig, IncomingRequests, Message, Transport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const CLIENT: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
    std::net::Ipv4Addr::new(10, 0, 0, 1),
    5683,
));
pub const SERVER: SocketAddr = SocketAddr::V4(std::net::SocketAddrV4::new(
    std::net::Ipv4Addr::new(10, 0, 0, 2),
    5683,
));

type Datagram = (Vec<u8>, SocketAddr);

/// Delivers datagrams between attached transports. Datagrams for unknown
/// addresses are lost, like on a real network.
#[derive(Default)]
pub struct Network {
    links: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
}

impl Network {
    pub fn new() -> Arc<Network> {
        Arc::new(Network::default())
    }

    pub fn attach(self: &Arc<Self>, addr: SocketAddr) -> Arc<MemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().insert(addr, tx);
        Arc::new(MemoryTransport {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            drop_next: AtomicUsize::new(0),
        })
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: Vec<u8>) {
        if let Some(link) = self.links.lock().unwrap().get(&to) {
            let _ = link.send((bytes, from));
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Instant,
    pub peer: SocketAddr,
    pub bytes: Vec<u8>,
}

impl Sent {
    pub fn message(&self) -> Message {
        Message::from_bytes(&self.bytes).unwrap()
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<Network>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    sent: Mutex<Vec<Sent>>,
    drop_next: AtomicUsize,
}

impl MemoryTransport {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Everything sent so far, including datagrams that were lost.
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent().iter().map(Sent::message).collect()
    }

    /// Loses the next `n` outbound datagrams.
    pub fn drop_next(&self, n: usize) {
        self.drop_next.store(n, Ordering::SeqCst);
    }

    pub async fn send_message(&self, message: &Message, peer: SocketAddr) {
        let bytes = message.to_bytes().unwrap();
        Transport::send_to(self, &bytes, peer).await.unwrap();
    }

    pub async fn recv_message(&self) -> (Message, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (n, peer) = Transport::recv_from(self, &mut buf).await.unwrap();
        (Message::from_bytes(&buf[..n]).unwrap(), peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push(Sent {
            at: Instant::now(),
            peer,
            bytes: buf.to_vec(),
        });
        let lost = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !lost {
            self.network.deliver(self.addr, peer, buf.to_vec());
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (bytes, from) = inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network gone"))?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok((n, from))
    }
}

pub struct Node {
    pub endpoint: Endpoint,
    pub transport: Arc<MemoryTransport>,
}

/// An endpoint attached to `network` at `addr`, already listening.
pub fn node(
    network: &Arc<Network>,
    addr: SocketAddr,
    config: EngineConfig,
) -> (Node, IncomingRequests) {
    let transport = network.attach(addr);
    let (endpoint, requests) = Endpoint::new(transport.clone(), config);
    endpoint.listen();
    (Node { endpoint, transport }, requests)
}

/// Answers every request with `handler`.
pub fn serve<F>(endpoint: Endpoint, mut requests: IncomingRequests, handler: F) -> JoinHandle<()>
where
    F: Fn(&Message) -> Message + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let response = handler(&request.message);
            let _ = endpoint.send_response(&request.handle, response).await;
        }
    })
}

pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

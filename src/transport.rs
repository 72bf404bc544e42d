use std::io::Result as IoResult;
use std::net::SocketAddr;

use async_trait::async_trait;
use log::debug;
use tokio::net::{ToSocketAddrs, UdpSocket};

/// A datagram transport the endpoint sends and receives through.
///
/// Implementations must be usable from several tasks at once: the
/// endpoint receives on one task while exchanges send from others.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one datagram to `peer`.
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> IoResult<usize>;

    /// Waits for the next datagram.
    async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)>;
}

#[async_trait]
impl Transport for UdpSocket {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> IoResult<usize> {
        UdpSocket::send_to(self, buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// Plain UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> IoResult<UdpTransport> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("bound to socket: {}", socket.local_addr()?);
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.socket.local_addr()
    }
}

impl From<UdpSocket> for UdpTransport {
    fn from(socket: UdpSocket) -> Self {
        UdpTransport { socket }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> IoResult<usize> {
        self.socket.send_to(buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> IoResult<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}

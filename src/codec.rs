//! [`tokio_util::codec`] adapter, one message per datagram.
//!
//! ```no_run
//! use futures::StreamExt;
//! use tokio::net::UdpSocket;
//! use tokio_util::udp::UdpFramed;
//! use coap_engine::codec::MessageCodec;
//!
//! # async fn run() -> std::io::Result<()> {
//! let socket = UdpSocket::bind("127.0.0.1:5683").await?;
//! let mut framed = UdpFramed::new(socket, MessageCodec::default());
//! while let Some(Ok((message, peer))) = framed.next().await {
//!     println!("{} sent {}", peer, message.header.get_code());
//! }
//! # Ok(())
//! # }
//! ```

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CoapError;
use crate::message::Message;

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CoapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, CoapError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split_to(buf.len());
        Ok(Some(Message::from_bytes(&datagram)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CoapError;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), CoapError> {
        Encoder::<&Message>::encode(self, &message, buf)
    }
}

impl<'a> Encoder<&'a Message> for MessageCodec {
    type Error = CoapError;

    fn encode(&mut self, message: &'a Message, buf: &mut BytesMut) -> Result<(), CoapError> {
        let bytes = message.to_bytes()?;
        buf.reserve(bytes.len());
        buf.put_slice(&bytes);
        Ok(())
    }
}

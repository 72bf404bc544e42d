//! A message exchange engine for the [CoAP Protocol][rfc].
//!
//! The crate turns datagrams into requests and responses and back: it
//! encodes and decodes messages, delivers confirmable messages reliably,
//! filters duplicates, matches responses to requests and transfers bodies
//! that do not fit into one datagram block by block.
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Option to provide custom transports through the [`Transport`] trait
//!
//! Resource handling is left to the application: requests arrive on
//! [`IncomingRequests`] and are answered with [`Endpoint::send_response`].
//!
//! # Installation
//!
//! First add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! coap-engine = "0.1"
//! tokio = {version = "^1.32", features = ["full"]}
//! ```
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use std::sync::Arc;
//! use coap_engine::{Endpoint, EngineConfig, Message, ResponseType, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let addr = "127.0.0.1:5683";
//!     let transport = UdpTransport::bind(addr).await.unwrap();
//!     let (endpoint, mut requests) = Endpoint::new(Arc::new(transport), EngineConfig::default());
//!     endpoint.listen();
//!     println!("Server up on {}", addr);
//!
//!     while let Some(request) = requests.recv().await {
//!         println!("request for {}", request.message.get_path());
//!         let mut response = Message::new_response(&request.message, ResponseType::Content);
//!         response.payload = b"OK".to_vec();
//!         endpoint.send_response(&request.handle, response).await.unwrap();
//!     }
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use std::sync::Arc;
//! use coap_engine::{Endpoint, EngineConfig, RequestBuilder, RequestType, UdpTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = UdpTransport::bind("127.0.0.1:0").await.unwrap();
//!     let (endpoint, _) = Endpoint::new(Arc::new(transport), EngineConfig::default());
//!     endpoint.listen();
//!
//!     let request = RequestBuilder::new("/Rust", RequestType::Get).build();
//!     let response = endpoint
//!         .request("127.0.0.1:5683".parse().unwrap(), request)
//!         .await
//!         .unwrap();
//!     println!("Server reply: {}", String::from_utf8(response.payload).unwrap());
//! }
//! ```
//!
//! [rfc]: https://tools.ietf.org/html/rfc7252

#[cfg(test)]
extern crate quickcheck;

pub use self::config::EngineConfig;
pub use self::endpoint::Endpoint;
pub use self::error::{
    BadOption, BlockSequenceError, CoapError, DecodeError, EncodingError, FormatError,
    InvalidBlockValue,
};
pub use self::exchange::PendingRequest;
pub use self::message::{
    CoapOption, ContentFormat, Message, MessageClass, MessageType, ObserveOption, OptionSet,
    RequestType, ResponseType,
};
pub use self::observer::{ObserveRelation, ObserveStream};
pub use self::request::{parse_coap_url, CoapUrl, RequestBuilder};
pub use self::server::{IncomingRequest, IncomingRequests, ResponseHandle};
pub use self::transport::{Transport, UdpTransport};

pub mod block;
pub mod block_transfer;
pub mod codec;
pub mod config;
pub mod dedup;
mod endpoint;
pub mod error;
mod exchange;
pub mod matcher;
pub mod message;
pub mod observer;
pub mod request;
pub mod retransmit;
mod server;
pub mod transport;

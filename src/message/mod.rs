//! The CoAP message model and its wire representation.

pub mod header;
pub mod options;
pub mod packet;

pub use header::{Header, MessageClass, MessageType, RequestType, ResponseType};
pub use options::{CoapOption, ContentFormat, ObserveOption, OptionSet};
pub use packet::Message;

/// Lower-case hex rendering of a token for log lines and errors.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

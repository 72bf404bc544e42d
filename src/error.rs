use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::message::header::{MessageClass, MessageType};
use crate::message::hex;

/// Malformed datagram. Always local: the datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("datagram of {0} bytes is shorter than the header")]
    HeaderTooShort(usize),
    #[error("unsupported protocol version {0}")]
    InvalidVersion(u8),
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    #[error("token length {0} exceeds the remaining bytes")]
    TruncatedToken(u8),
    #[error("reserved code 0x{0:02x}")]
    ReservedCode(u8),
    #[error("reserved option delta nibble")]
    InvalidOptionDelta,
    #[error("reserved option length nibble")]
    InvalidOptionLength,
    #[error("option runs past the end of the datagram")]
    TruncatedOption,
    #[error("payload marker is not followed by a payload")]
    EmptyPayload,
    #[error("empty message carries {0} trailing bytes")]
    NonEmptyEmptyMessage(usize),
}

/// A message that cannot be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("token of {0} bytes exceeds 8 bytes")]
    TokenTooLong(usize),
    #[error("option {number} value of {length} bytes exceeds the maximum of {max}")]
    OptionTooLong {
        number: u16,
        length: usize,
        max: usize,
    },
    #[error("code {code:?} cannot be sent as {message_type:?}")]
    InvalidCombination {
        code: MessageClass,
        message_type: MessageType,
    },
    #[error("empty message must not carry a token, options or a payload")]
    NonEmptyEmptyMessage,
}

/// An unrecognized critical option. Carries enough of the header for the
/// receiver to answer with 4.02 Bad Option (or a reset).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized critical option {number}")]
pub struct BadOption {
    pub number: u16,
    pub message_type: MessageType,
    pub code: MessageClass,
    pub message_id: u16,
    pub token: Vec<u8>,
}

impl BadOption {
    pub fn is_request(&self) -> bool {
        matches!(self.code, MessageClass::Request(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    BadOption(#[from] BadOption),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidBlockValue {
    #[error("block number {0} does not fit in 20 bits")]
    NumberOutOfRange(u32),
    #[error("reserved block size exponent {0}")]
    SizeExponent(u8),
    #[error("block option of {0} bytes is longer than 3 bytes")]
    OptionLength(usize),
}

/// The peer violated the block-wise sequence. Aborts the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockSequenceError {
    #[error("block {got} is out of sequence, expected block {expected}")]
    OutOfOrder { expected: u32, got: u32 },
    #[error("block {num} carries {length} bytes but the block size is {size}")]
    InvalidLength { num: u32, length: usize, size: usize },
    #[error("transfer exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Error)]
pub enum CoapError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("token {} is already in use for {peer}", hex(.token))]
    TokenInUse { peer: SocketAddr, token: Vec<u8> },
    #[error(transparent)]
    BlockSequence(#[from] BlockSequenceError),
    #[error(transparent)]
    InvalidBlock(#[from] InvalidBlockValue),
    #[error("no acknowledgement after {attempts} transmissions")]
    TimedOut { attempts: u32 },
    #[error("exchange reset by peer")]
    Reset,
    #[error("no response within the exchange lifetime")]
    LifetimeExpired,
    #[error("exchange cancelled")]
    Cancelled,
    #[error("endpoint closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = CoapError> = std::result::Result<T, E>;

//! Block-wise transfer primitives: the BLOCK1/BLOCK2 option value, an
//! outbound fragmenter and an inbound reassembler.

use std::cmp;

use crate::error::{BlockSequenceError, InvalidBlockValue};
use crate::message::options::{decode_uint, encode_uint};
use crate::message::{CoapOption, Message};

/// szx of 1024 byte blocks, the largest usable over UDP.
pub const MAX_SIZE_EXPONENT: u8 = 6;

const MAX_BLOCK_NUMBER: u32 = (1 << 20) - 1;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    pub fn new(num: u32, more: bool, size_exponent: u8) -> Result<Self, InvalidBlockValue> {
        if num > MAX_BLOCK_NUMBER {
            return Err(InvalidBlockValue::NumberOutOfRange(num));
        }
        if size_exponent > MAX_SIZE_EXPONENT {
            return Err(InvalidBlockValue::SizeExponent(size_exponent));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// Byte offset of this block within the body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block_value: BlockValue) -> Vec<u8> {
        let scalar = block_value.num << 4
            | u32::from(block_value.more) << 3
            | u32::from(block_value.size_exponent & 0x7);
        encode_uint(scalar)
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = InvalidBlockValue;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() > 3 {
            return Err(InvalidBlockValue::OptionLength(value.len()));
        }
        let scalar = decode_uint(value).ok_or(InvalidBlockValue::OptionLength(value.len()))?;

        let num = scalar >> 4;
        let more = scalar >> 3 & 0x1 == 0x1;
        let size_exponent = (scalar & 0x7) as u8;
        BlockValue::new(num, more, size_exponent)
    }
}

/// The size exponent of the largest block not exceeding `size`,
/// clamped to the 16..=1024 byte range.
pub fn size_exponent_for(size: usize) -> u8 {
    let power = usize::BITS - 1 - cmp::max(size, 1).leading_zeros();
    (power.clamp(4, 10) - 4) as u8
}

/// Block `num` of `body` at the given size, or `None` past the end.
/// An empty body still has a single empty block 0.
pub fn block_slice(body: &[u8], num: u32, size_exponent: u8) -> Option<(BlockValue, &[u8])> {
    let size = 1usize << (size_exponent + 4);
    let offset = num as usize * size;
    if offset > body.len() || (offset == body.len() && num != 0) {
        return None;
    }
    let end = cmp::min(offset + size, body.len());
    let block = BlockValue {
        num,
        more: end < body.len(),
        size_exponent,
    };
    Some((block, &body[offset..end]))
}

impl Message {
    pub fn get_block1(&self) -> Result<Option<BlockValue>, InvalidBlockValue> {
        self.get_block(CoapOption::Block1)
    }

    pub fn get_block2(&self) -> Result<Option<BlockValue>, InvalidBlockValue> {
        self.get_block(CoapOption::Block2)
    }

    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block1, block.into());
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block2, block.into());
    }

    fn get_block(&self, option: CoapOption) -> Result<Option<BlockValue>, InvalidBlockValue> {
        self.get_first_option(option)
            .map(|value| BlockValue::try_from(value.as_slice()))
            .transpose()
    }
}

/// Cursor over an outbound body. Block N+1 is only produced after
/// [`advance`](Fragmenter::advance), so transfers stay strictly sequential.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    body: Vec<u8>,
    offset: usize,
    size_exponent: u8,
}

impl Fragmenter {
    pub fn new(body: Vec<u8>, size_exponent: u8) -> Fragmenter {
        Fragmenter {
            body,
            offset: 0,
            size_exponent: cmp::min(size_exponent, MAX_SIZE_EXPONENT),
        }
    }

    pub fn block_size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    pub fn size_exponent(&self) -> u8 {
        self.size_exponent
    }

    /// The block at the cursor.
    pub fn current(&self) -> (BlockValue, &[u8]) {
        let num = (self.offset / self.block_size()) as u32;
        // offset is always a multiple of the current size and at most body.len()
        block_slice(&self.body, num, self.size_exponent).unwrap_or((
            BlockValue {
                num,
                more: false,
                size_exponent: self.size_exponent,
            },
            &[],
        ))
    }

    /// Moves past the current block. Returns false when it was the last one.
    pub fn advance(&mut self) -> bool {
        let (block, chunk) = self.current();
        self.offset += chunk.len();
        block.more
    }

    /// Switches to a smaller block size requested by the peer. Larger
    /// sizes are ignored.
    pub fn renegotiate(&mut self, size_exponent: u8) {
        if size_exponent < self.size_exponent {
            self.size_exponent = size_exponent;
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Reassembles an inbound body block by block.
#[derive(Debug, Clone)]
pub struct BlockAssembler {
    buffer: Vec<u8>,
    max_size: usize,
}

impl BlockAssembler {
    pub fn new(max_size: usize) -> BlockAssembler {
        BlockAssembler {
            buffer: Vec::new(),
            max_size,
        }
    }

    /// Bytes accumulated so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of the block expected next at the given size.
    pub fn next_num(&self, size_exponent: u8) -> u32 {
        (self.buffer.len() >> (size_exponent + 4)) as u32
    }

    /// Appends a block. Returns the complete body once the block without
    /// the more flag arrives.
    pub fn push(
        &mut self,
        block: BlockValue,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, BlockSequenceError> {
        if block.offset() != self.buffer.len() {
            return Err(BlockSequenceError::OutOfOrder {
                expected: self.next_num(block.size_exponent),
                got: block.num,
            });
        }
        if payload.len() > block.size() || (block.more && payload.len() != block.size()) {
            return Err(BlockSequenceError::InvalidLength {
                num: block.num,
                length: payload.len(),
                size: block.size(),
            });
        }
        if self.buffer.len() + payload.len() > self.max_size {
            return Err(BlockSequenceError::TooLarge(self.max_size));
        }

        self.buffer.extend_from_slice(payload);
        if block.more {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }
}

//! LEB128 variable-length unsigned integers.

use crate::error::{StoreError, StoreResult};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: u64 = 10;

/// Encode a u64 as a variable-length integer.
pub fn encode_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Incremental LEB128 decoder fed one byte at a time.
#[derive(Clone, Copy, Debug, Default)]
pub struct VarintDecoder {
    value: u64,
    shift: u32,
}

impl VarintDecoder {
    /// Consume one byte. Yields the value once the final byte arrives.
    pub fn push(&mut self, byte: u8) -> StoreResult<Option<u64>> {
        let payload = u64::from(byte & 0x7F);
        if self.shift == 63 && payload > 1 {
            return Err(StoreError::CorruptVarint("varint overflow".into()));
        }
        self.value |= payload << self.shift;
        if byte & 0x80 == 0 {
            return Ok(Some(self.value));
        }
        self.shift += 7;
        if self.shift > 63 {
            return Err(StoreError::CorruptVarint("varint overflow".into()));
        }
        Ok(None)
    }
}

/// Number of bytes `value` occupies when encoded.
pub fn varint_len(value: u64) -> u64 {
    let bits = 64 - value.leading_zeros() as u64;
    bits.div_ceil(7).max(1)
}

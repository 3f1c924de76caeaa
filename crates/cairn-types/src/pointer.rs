use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Pointer to a chunk in the chunk store.
///
/// A `ChunkPointer` is an opaque chunk id handed out by the allocator. The
/// value `0` never names a chunk and encodes "no reference", so a zero-filled
/// slot always decodes as null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ChunkPointer(u64);

impl ChunkPointer {
    /// Width of the fixed encoding in bytes.
    pub const FIXED_BYTES: u64 = 8;

    /// Wrap a raw chunk id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The null pointer. Represents "no chunk".
    pub const fn null() -> Self {
        Self(0)
    }

    /// Returns `true` if this is the null pointer.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The raw chunk id.
    pub fn id(&self) -> u64 {
        self.0
    }

    /// Fixed little-endian encoding.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode the fixed little-endian encoding.
    pub fn from_le_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: 8,
            actual: bytes.len(),
        })?;
        Ok(Self(u64::from_le_bytes(arr)))
    }
}

impl fmt::Debug for ChunkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ChunkPointer(null)")
        } else {
            write!(f, "ChunkPointer({})", self.0)
        }
    }
}

impl fmt::Display for ChunkPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "*null")
        } else {
            write!(f, "*{}", self.0)
        }
    }
}

impl From<u64> for ChunkPointer {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<ChunkPointer> for u64 {
    fn from(ptr: ChunkPointer) -> Self {
        ptr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_zero() {
        let null = ChunkPointer::null();
        assert!(null.is_null());
        assert_eq!(null.id(), 0);
        assert_eq!(ChunkPointer::default(), null);
    }

    #[test]
    fn le_bytes_roundtrip() {
        let ptr = ChunkPointer::new(0x0102_0304_0506);
        let bytes = ptr.to_le_bytes();
        assert_eq!(bytes[0], 0x06);
        assert_eq!(ChunkPointer::from_le_slice(&bytes).unwrap(), ptr);
    }

    #[test]
    fn from_short_slice_fails() {
        let err = ChunkPointer::from_le_slice(&[1, 2, 3]).unwrap_err();
        assert_eq!(err, TypeError::InvalidLength { expected: 8, actual: 3 });
    }

    #[test]
    fn display_forms() {
        assert_eq!(format!("{}", ChunkPointer::new(7)), "*7");
        assert_eq!(format!("{}", ChunkPointer::null()), "*null");
        assert_eq!(format!("{:?}", ChunkPointer::new(7)), "ChunkPointer(7)");
    }

    #[test]
    fn serde_roundtrip() {
        let ptr = ChunkPointer::new(42);
        let json = serde_json::to_string(&ptr).unwrap();
        let parsed: ChunkPointer = serde_json::from_str(&json).unwrap();
        assert_eq!(ptr, parsed);
    }
}

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Byte width of a dynamically sized unsigned number.
///
/// A `NumberSize` is itself stored as a one-byte ordinal. Fields whose width
/// is governed by a `NumberSize` field are written with exactly
/// [`bytes`](NumberSize::bytes) little-endian bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NumberSize {
    Void,
    Byte,
    Short,
    SmallInt,
    Int,
    BigInt,
    SmallLong,
    Long,
}

impl NumberSize {
    /// Every size, smallest first.
    pub const ALL: [NumberSize; 8] = [
        NumberSize::Void,
        NumberSize::Byte,
        NumberSize::Short,
        NumberSize::SmallInt,
        NumberSize::Int,
        NumberSize::BigInt,
        NumberSize::SmallLong,
        NumberSize::Long,
    ];

    /// The largest size.
    pub const MAX: NumberSize = NumberSize::Long;

    /// Number of bytes a value of this size occupies.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Void => 0,
            Self::Byte => 1,
            Self::Short => 2,
            Self::SmallInt => 3,
            Self::Int => 4,
            Self::BigInt => 5,
            Self::SmallLong => 6,
            Self::Long => 8,
        }
    }

    /// Largest unsigned value representable in this size.
    pub const fn max_value(self) -> u64 {
        match self {
            Self::Void => 0,
            Self::Long => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }

    /// Smallest size that can hold `value`.
    pub fn fitting(value: u64) -> Self {
        Self::ALL
            .into_iter()
            .find(|size| value <= size.max_value())
            .unwrap_or(Self::Long)
    }

    /// Returns `true` if `value` is representable in this size.
    pub fn can_fit(self, value: u64) -> bool {
        value <= self.max_value()
    }

    /// Fail with [`TypeError::NumberTooLarge`] if `value` does not fit.
    pub fn check(self, value: u64) -> Result<(), TypeError> {
        if self.can_fit(value) {
            Ok(())
        } else {
            Err(TypeError::NumberTooLarge { value, size: self })
        }
    }

    /// Stored ordinal.
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Parse a stored ordinal.
    pub fn from_ordinal(ordinal: u8) -> Result<Self, TypeError> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(TypeError::InvalidNumberSize(ordinal))
    }
}

/// Fixed-width scalar kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrimitiveKind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl PrimitiveKind {
    /// Encoded width in bytes.
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    /// Registry name of the kind.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Returns `true` for the integer kinds usable as counts.
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Bool | Self::F32 | Self::F64)
    }

    /// Every kind, in registry order.
    pub const ALL: [PrimitiveKind; 11] = [
        PrimitiveKind::Bool,
        PrimitiveKind::I8,
        PrimitiveKind::I16,
        PrimitiveKind::I32,
        PrimitiveKind::I64,
        PrimitiveKind::U8,
        PrimitiveKind::U16,
        PrimitiveKind::U32,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
    ];
}

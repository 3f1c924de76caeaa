use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid number size ordinal: {0}")]
    InvalidNumberSize(u8),

    #[error("value {value} does not fit in {size:?}")]
    NumberTooLarge { value: u64, size: crate::NumberSize },

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

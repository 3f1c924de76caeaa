use cairn_types::{ChunkPointer, TypeError};

/// Errors from byte-stream and chunk-store operations.
///
/// Errors are `Clone` so that callers can cache and replay failures; the
/// I/O variant therefore keeps the error kind and message rather than the
/// `std::io::Error` itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A read needed more bytes than the stream holds.
    #[error("unexpected end of stream: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: u64, available: u64 },

    /// The chunk does not exist (never allocated or already freed).
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkPointer),

    /// A variable-length integer could not be decoded.
    #[error("corrupt varint: {0}")]
    CorruptVarint(String),

    /// Bytes decoded to an invalid value.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Word widths are limited to eight bytes.
    #[error("unsupported word width: {0} bytes")]
    InvalidWordWidth(u64),

    /// I/O error from an underlying device.
    #[error("I/O error: {message} ({kind:?})")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error(transparent)]
    Type(#[from] TypeError),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StoreError = io_err.into();
        match err {
            StoreError::Io { kind, message } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(message.contains("gone"));
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn eof_display() {
        let err = StoreError::UnexpectedEof { needed: 8, available: 3 };
        assert_eq!(
            err.to_string(),
            "unexpected end of stream: needed 8 bytes, 3 available"
        );
    }
}

//! Error types for pipe compilation and schema-driven I/O.

use cairn_store::StoreError;
use cairn_types::{NumberSize, TypeError};

/// Errors from compiling or running a pipe.
///
/// Compile-time failures are cached per type and replayed on every later
/// use, which is why the enum is `Clone`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipeError {
    /// The type cannot be laid out under the requested constraint.
    #[error("unsupported layout for {schema}: {reason}")]
    UnsupportedStructLayout { schema: String, reason: String },

    /// A value kind has no fixed-width encoding.
    #[error("fixed format not supported for {ty}: {reason}")]
    FixedFormatNotSupported { ty: String, reason: String },

    /// Compilation of a type re-entered itself.
    #[error("recursive compilation of {key}")]
    RecursiveCompile { key: String },

    /// A non-nullable field holds null.
    #[error("field {schema}.{field} is not nullable but holds null")]
    NullValue { schema: String, field: String },

    /// A generated field is inconsistent with its sources.
    #[error("generator invariant violated for {schema}.{field}: {reason}")]
    GeneratorInvariant {
        schema: String,
        field: String,
        reason: String,
    },

    /// Holistic and per-field sizes (or measured bytes) disagree.
    #[error("size mismatch in {schema}: {what} is {actual}, expected {expected}")]
    SizeMismatch {
        schema: String,
        what: String,
        expected: u64,
        actual: u64,
    },

    /// A value does not match the declared type of its slot.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// A stored runtime type id is not registered.
    #[error("unknown type id {0}")]
    UnknownTypeId(u32),

    /// A value is wider than the width chosen for a varying layout.
    #[error("value {value} of {field} does not fit chosen width {width:?}")]
    VaryingSizeTooSmall {
        field: String,
        width: NumberSize,
        value: u64,
    },

    /// The schema description itself is inconsistent.
    #[error("invalid schema {schema}: {reason}")]
    InvalidSchema { schema: String, reason: String },

    /// The terminal build step of an immutable type rejected the value.
    #[error("build of {schema} failed: {reason}")]
    Build { schema: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// An I/O failure while handling one field.
    #[error("{schema}.{field} ({ty}): {source}")]
    InField {
        schema: String,
        field: String,
        ty: String,
        #[source]
        source: Box<PipeError>,
    },
}

impl PipeError {
    /// Returns `true` for layout errors, the ones a caller may answer by
    /// falling back to a reference.
    pub fn is_layout(&self) -> bool {
        matches!(
            self,
            PipeError::UnsupportedStructLayout { .. } | PipeError::FixedFormatNotSupported { .. }
        )
    }

    /// Returns `true` if this is a recursive-compilation failure.
    pub fn is_recursive(&self) -> bool {
        matches!(self, PipeError::RecursiveCompile { .. })
    }

    /// The innermost error, looking through field wrappers.
    pub fn root(&self) -> &PipeError {
        match self {
            PipeError::InField { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach field context to I/O failures. Other errors already carry
    /// their own context and pass through unchanged.
    pub(crate) fn in_field(self, schema: &str, field: &str, ty: &str) -> Self {
        match self {
            PipeError::Store(_) => PipeError::InField {
                schema: schema.to_string(),
                field: field.to_string(),
                ty: ty.to_string(),
                source: Box::new(self),
            },
            other => other,
        }
    }

    pub(crate) fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        PipeError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<TypeError> for PipeError {
    fn from(err: TypeError) -> Self {
        PipeError::Store(StoreError::Type(err))
    }
}

/// Result alias for pipe operations.
pub type PipeResult<T> = Result<T, PipeError>;

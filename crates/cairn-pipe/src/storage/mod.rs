//! Per-type value encodings.
//!
//! A [`ValueStorage`] is chosen once per declared type and storage rule by
//! [`make_storage`] and cached for the life of the process. It decides
//! whether a value lives inline in its parent's bytes or behind a chunk
//! pointer, and offers the same read, write, skip, sizing and pointer-walk
//! operations for every choice.

mod dynamic;
mod embedded;
mod reference;
pub(crate) mod scalar;

use std::fmt;
use std::sync::{Arc, LazyLock};

use tracing::debug;

use cairn_store::{ContentReader, ContentWriter, RandomIo};
use cairn_types::{ChunkPointer, PrimitiveKind, SizeDescriptor};

use crate::cache::CompileCache;
use crate::error::{PipeError, PipeResult};
use crate::field::FieldCodec;
use crate::pipe::StructPipe;
use crate::provider::DataProvider;
use crate::schema::{DeclaredType, FieldDef, Schema, SealedType, StorageRule, TypeKey, WrapperType};
use crate::value::Value;

pub use embedded::PipeRef;

use reference::TAGGED_BYTES;
use scalar::{inline_string_size, read_inline_string, read_primitive, skip_inline_string};
use scalar::{write_inline_string, write_primitive};

/// Encoding strategy for one declared type under one storage rule.
pub enum ValueStorage {
    /// Native-width scalar.
    Primitive(PrimitiveKind),
    /// `varint(len + 1)` then UTF-8; zero is null.
    InlineString,
    /// `u64` pointer to a chunk holding the UTF-8 bytes.
    FixedReferenceString,
    /// Nested standard pipe.
    Instance(PipeRef),
    /// Nested fixed pipe.
    FixedInstance(PipeRef),
    /// `u64` pointer to a chunk holding a standard pipe body.
    FixedReferenceInstance(PipeRef),
    /// Pointer to an externally managed chunk: varint under the default
    /// rule, `u64` under fixed rules.
    UnmanagedInstance { schema: Arc<Schema>, fixed: bool },
    /// Varint tag then the variant's standard body.
    SealedInstance(Arc<SealedType>),
    /// `u32` tag then a `u64` pointer to the variant's body.
    FixedReferenceSealedInstance(Arc<SealedType>),
    /// Varint registry id then the default encoding of that type.
    UnknownIdObject,
    /// `u32` registry id then a `u64` pointer.
    UnknownIdReference,
    /// The wrapper's one-field carrier pipe.
    InlineWrapped { wrapper: Arc<WrapperType>, pipe: PipeRef },
}

static STORAGE_CACHE: LazyLock<CompileCache<(TypeKey, StorageRule), Arc<ValueStorage>>> =
    LazyLock::new(|| CompileCache::new("storage"));

/// Storage for `declared` under `rule`, built once and shared.
pub fn make_storage(declared: &DeclaredType, rule: StorageRule) -> PipeResult<Arc<ValueStorage>> {
    STORAGE_CACHE.get_or_compile(&(declared.key(), rule), || {
        select(&declared.resolve()?, rule).map(Arc::new)
    })
}

fn select(declared: &DeclaredType, rule: StorageRule) -> PipeResult<ValueStorage> {
    let fixed = rule.is_fixed();
    Ok(match declared {
        DeclaredType::Any if fixed => ValueStorage::UnknownIdReference,
        DeclaredType::Any => ValueStorage::UnknownIdObject,
        DeclaredType::Primitive(kind) => ValueStorage::Primitive(*kind),
        DeclaredType::String if fixed => ValueStorage::FixedReferenceString,
        DeclaredType::String => ValueStorage::InlineString,
        DeclaredType::Wrapper(wrapper) => {
            let pipe = if fixed {
                let pipe = StructPipe::fixed(wrapper.carrier()).map_err(|err| {
                    if err.is_layout() || err.is_recursive() {
                        PipeError::FixedFormatNotSupported {
                            ty: wrapper.name().to_string(),
                            reason: err.root().to_string(),
                        }
                    } else {
                        err
                    }
                })?;
                PipeRef::ready(pipe)
            } else {
                PipeRef::lazy(wrapper.carrier())
            };
            ValueStorage::InlineWrapped {
                wrapper: Arc::clone(wrapper),
                pipe,
            }
        }
        DeclaredType::Sealed(sealed) if fixed => {
            ValueStorage::FixedReferenceSealedInstance(Arc::clone(sealed))
        }
        DeclaredType::Sealed(sealed) => ValueStorage::SealedInstance(Arc::clone(sealed)),
        DeclaredType::Struct(schema) if schema.is_unmanaged() => ValueStorage::UnmanagedInstance {
            schema: Arc::clone(schema),
            fixed,
        },
        DeclaredType::Struct(schema) if fixed => match StructPipe::fixed(schema) {
            Ok(pipe) => ValueStorage::FixedInstance(PipeRef::ready(pipe)),
            Err(err) if err.is_layout() || err.is_recursive() => {
                debug!(
                    schema = schema.name(),
                    reason = %err.root(),
                    "no fixed layout, storing by reference"
                );
                ValueStorage::FixedReferenceInstance(PipeRef::lazy(schema))
            }
            Err(err) => return Err(err),
        },
        DeclaredType::Struct(schema) => ValueStorage::Instance(PipeRef::lazy(schema)),
        DeclaredType::SelfRef(r) => return select(&DeclaredType::Struct(r.upgrade()?), rule),
    })
}

impl ValueStorage {
    pub fn name(&self) -> &'static str {
        match self {
            ValueStorage::Primitive(_) => "Primitive",
            ValueStorage::InlineString => "InlineString",
            ValueStorage::FixedReferenceString => "FixedReferenceString",
            ValueStorage::Instance(_) => "Instance",
            ValueStorage::FixedInstance(_) => "FixedInstance",
            ValueStorage::FixedReferenceInstance(_) => "FixedReferenceInstance",
            ValueStorage::UnmanagedInstance { .. } => "UnmanagedInstance",
            ValueStorage::SealedInstance(_) => "SealedInstance",
            ValueStorage::FixedReferenceSealedInstance(_) => "FixedReferenceSealedInstance",
            ValueStorage::UnknownIdObject => "UnknownIdObject",
            ValueStorage::UnknownIdReference => "UnknownIdReference",
            ValueStorage::InlineWrapped { .. } => "InlineWrapped",
        }
    }

    /// Whether the encoding has its own representation of null.
    pub fn has_native_null(&self) -> bool {
        !matches!(
            self,
            ValueStorage::Primitive(_)
                | ValueStorage::Instance(_)
                | ValueStorage::FixedInstance(_)
                | ValueStorage::InlineWrapped { .. }
        )
    }

    /// Codec for a field declared as `def`, adding a presence byte when the
    /// field is nullable and the encoding cannot express null.
    pub fn field(self: &Arc<Self>, def: &FieldDef) -> FieldCodec {
        FieldCodec::Storage {
            storage: Arc::clone(self),
            presence: def.nullable && !self.has_native_null(),
        }
    }

    pub fn size_descriptor(&self) -> SizeDescriptor {
        match self {
            ValueStorage::Primitive(kind) => SizeDescriptor::Fixed(kind.bytes()),
            ValueStorage::InlineString | ValueStorage::UnknownIdObject => SizeDescriptor::unknown(1),
            ValueStorage::FixedReferenceString | ValueStorage::FixedReferenceInstance(_) => {
                SizeDescriptor::Fixed(ChunkPointer::FIXED_BYTES)
            }
            ValueStorage::Instance(pipe)
            | ValueStorage::FixedInstance(pipe)
            | ValueStorage::InlineWrapped { pipe, .. } => pipe.size_descriptor(),
            ValueStorage::UnmanagedInstance { fixed: true, .. } => {
                SizeDescriptor::Fixed(ChunkPointer::FIXED_BYTES)
            }
            ValueStorage::UnmanagedInstance { fixed: false, .. } => {
                SizeDescriptor::bounded(1, cairn_store::varint::MAX_VARINT_LEN)
            }
            ValueStorage::SealedInstance(sealed) => dynamic::sealed_descriptor(sealed),
            ValueStorage::FixedReferenceSealedInstance(_) | ValueStorage::UnknownIdReference => {
                SizeDescriptor::Fixed(TAGGED_BYTES)
            }
        }
    }

    /// Bytes every value occupies inline, or `None` when it varies.
    pub fn inline_size(&self) -> Option<u64> {
        self.size_descriptor().fixed()
    }

    /// Regenerate the generated fields of structs embedded inline in
    /// `value`. Values behind references are regenerated when written.
    pub(crate) fn generate(&self, value: &mut Value) -> PipeResult<()> {
        match (self, value) {
            (ValueStorage::Instance(pipe) | ValueStorage::FixedInstance(pipe), Value::Struct(inst)) => {
                pipe.get()?.generate(inst)
            }
            (ValueStorage::InlineWrapped { pipe, .. }, Value::Wrapped(_, carrier)) => {
                pipe.get()?.generate(carrier)
            }
            (ValueStorage::SealedInstance(sealed), Value::Struct(inst)) => {
                dynamic::variant_pipe(sealed, dynamic::tag_of(sealed, inst)?)?.generate(inst)
            }
            (ValueStorage::UnknownIdObject, Value::Struct(inst)) if !inst.schema().is_unmanaged() => {
                StructPipe::standard(inst.schema())?.generate(inst)
            }
            (ValueStorage::UnknownIdObject, Value::Wrapped(wrapper, carrier)) => {
                StructPipe::standard(wrapper.carrier())?.generate(carrier)
            }
            _ => Ok(()),
        }
    }

    /// Whether encoded values may hold chunk pointers.
    pub fn needs_removal(&self) -> bool {
        match self {
            ValueStorage::Primitive(_) | ValueStorage::InlineString => false,
            ValueStorage::Instance(pipe)
            | ValueStorage::FixedInstance(pipe)
            | ValueStorage::InlineWrapped { pipe, .. } => pipe.needs_removal(),
            ValueStorage::SealedInstance(sealed) => dynamic::sealed_needs_removal(sealed),
            _ => true,
        }
    }

    /// Encode `value`. Reference encodings reuse the chunk recorded in
    /// `reference` and update it when a chunk is allocated.
    pub fn write(
        &self,
        provider: &DataProvider,
        dest: &mut dyn ContentWriter,
        value: &mut Value,
        reference: &mut ChunkPointer,
    ) -> PipeResult<()> {
        match self {
            ValueStorage::Primitive(kind) => write_primitive(dest, *kind, value),
            ValueStorage::InlineString => write_inline_string(dest, value),
            ValueStorage::FixedReferenceString => {
                reference::write_string(provider, dest, value, reference)
            }
            ValueStorage::Instance(pipe) | ValueStorage::FixedInstance(pipe) => {
                embedded::write_struct(provider, pipe, dest, value)
            }
            ValueStorage::FixedReferenceInstance(pipe) => {
                reference::write_struct(provider, pipe, dest, value, reference)
            }
            ValueStorage::UnmanagedInstance { schema, fixed } => {
                reference::write_handle(dest, schema, *fixed, value)
            }
            ValueStorage::SealedInstance(sealed) => {
                dynamic::write_sealed(provider, sealed, dest, value)
            }
            ValueStorage::FixedReferenceSealedInstance(sealed) => {
                reference::write_sealed(provider, sealed, dest, value, reference)
            }
            ValueStorage::UnknownIdObject => dynamic::write_any(provider, dest, value),
            ValueStorage::UnknownIdReference => {
                reference::write_any(provider, dest, value, reference)
            }
            ValueStorage::InlineWrapped { wrapper, pipe } => {
                embedded::write_wrapped(provider, wrapper, pipe, dest, value)
            }
        }
    }

    /// Decode a value, recording the chunk it was loaded from.
    pub fn read_new(
        &self,
        provider: &DataProvider,
        src: &mut dyn ContentReader,
        reference: &mut ChunkPointer,
    ) -> PipeResult<Value> {
        match self {
            ValueStorage::Primitive(kind) => read_primitive(src, *kind),
            ValueStorage::InlineString => read_inline_string(src),
            ValueStorage::FixedReferenceString => reference::read_string(provider, src, reference),
            ValueStorage::Instance(pipe) | ValueStorage::FixedInstance(pipe) => {
                embedded::read_struct(provider, pipe, src)
            }
            ValueStorage::FixedReferenceInstance(pipe) => {
                reference::read_struct(provider, pipe, src, reference)
            }
            ValueStorage::UnmanagedInstance { schema, fixed } => {
                reference::read_handle(src, schema, *fixed)
            }
            ValueStorage::SealedInstance(sealed) => dynamic::read_sealed(provider, sealed, src),
            ValueStorage::FixedReferenceSealedInstance(sealed) => {
                reference::read_sealed(provider, sealed, src, reference)
            }
            ValueStorage::UnknownIdObject => dynamic::read_any(provider, src),
            ValueStorage::UnknownIdReference => reference::read_any(provider, src, reference),
            ValueStorage::InlineWrapped { wrapper, pipe } => {
                embedded::read_wrapped(provider, wrapper, pipe, src)
            }
        }
    }

    pub fn skip(&self, provider: &DataProvider, src: &mut dyn ContentReader) -> PipeResult<()> {
        match self {
            ValueStorage::InlineString => skip_inline_string(src),
            ValueStorage::Instance(pipe)
            | ValueStorage::FixedInstance(pipe)
            | ValueStorage::InlineWrapped { pipe, .. } => pipe.get()?.skip(provider, src),
            ValueStorage::UnmanagedInstance { fixed, .. } => reference::skip_handle(src, *fixed),
            ValueStorage::SealedInstance(sealed) => dynamic::skip_sealed(provider, sealed, src),
            ValueStorage::UnknownIdObject => dynamic::skip_any(provider, src),
            fixed => match fixed.inline_size() {
                Some(n) => Ok(src.skip_exact(n)?),
                None => Err(PipeError::InvalidSchema {
                    schema: fixed.name().into(),
                    reason: "variable storage without a skip rule".into(),
                }),
            },
        }
    }

    /// Encoded size of `value`.
    pub fn size_of(&self, provider: &DataProvider, value: &Value) -> PipeResult<u64> {
        match self {
            ValueStorage::InlineString => inline_string_size(value),
            ValueStorage::Instance(pipe) | ValueStorage::FixedInstance(pipe) => {
                embedded::size_struct(provider, pipe, value)
            }
            ValueStorage::InlineWrapped { wrapper, pipe } => {
                embedded::size_wrapped(provider, wrapper, pipe, value)
            }
            ValueStorage::UnmanagedInstance { fixed, .. } => reference::handle_size(*fixed, value),
            ValueStorage::SealedInstance(sealed) => dynamic::sealed_size(provider, sealed, value),
            ValueStorage::UnknownIdObject => dynamic::any_size(provider, value),
            fixed => Ok(fixed.inline_size().unwrap_or(0)),
        }
    }

    /// Walk one encoded value from the current position and return the
    /// chunk pointers it holds, including those inside referenced chunks.
    ///
    /// With `dereference` set, reference slots are zeroed in place.
    pub fn notify_removal(
        &self,
        provider: &DataProvider,
        io: &mut dyn RandomIo,
        dereference: bool,
    ) -> PipeResult<Vec<ChunkPointer>> {
        match self {
            ValueStorage::Primitive(_) | ValueStorage::InlineString => {
                self.skip(provider, io)?;
                Ok(Vec::new())
            }
            ValueStorage::FixedReferenceString => {
                reference::release_string(provider, io, dereference)
            }
            ValueStorage::Instance(pipe)
            | ValueStorage::FixedInstance(pipe)
            | ValueStorage::InlineWrapped { pipe, .. } => {
                pipe.get()?.notify_removal(provider, io, dereference)
            }
            ValueStorage::FixedReferenceInstance(pipe) => {
                reference::release_struct(provider, pipe, io, dereference)
            }
            ValueStorage::UnmanagedInstance { schema, fixed } => {
                reference::release_handle(provider, io, schema, *fixed, dereference)
            }
            ValueStorage::SealedInstance(sealed) => {
                dynamic::release_sealed(provider, sealed, io, dereference)
            }
            ValueStorage::FixedReferenceSealedInstance(sealed) => {
                reference::release_sealed(provider, sealed, io, dereference)
            }
            ValueStorage::UnknownIdObject => dynamic::release_any(provider, io, dereference),
            ValueStorage::UnknownIdReference => reference::release_any(provider, io, dereference),
        }
    }
}

impl fmt::Debug for ValueStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueStorage::Primitive(kind) => write!(f, "Primitive({})", kind.name()),
            ValueStorage::Instance(pipe)
            | ValueStorage::FixedInstance(pipe)
            | ValueStorage::FixedReferenceInstance(pipe) => {
                write!(f, "{}({})", self.name(), pipe.schema().name())
            }
            ValueStorage::UnmanagedInstance { schema, fixed } => {
                write!(f, "UnmanagedInstance({}, fixed: {fixed})", schema.name())
            }
            ValueStorage::SealedInstance(sealed)
            | ValueStorage::FixedReferenceSealedInstance(sealed) => {
                write!(f, "{}({})", self.name(), sealed.name())
            }
            ValueStorage::InlineWrapped { wrapper, .. } => {
                write!(f, "InlineWrapped({})", wrapper.name())
            }
            other => f.write_str(other.name()),
        }
    }
}

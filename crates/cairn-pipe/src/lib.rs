//! Schema-compiled binary I/O for Cairn.
//!
//! A [`Schema`] describes a structured type. A [`StructPipe`] compiled from
//! it writes, reads and skips instances in a compact positional encoding,
//! and serves partial reads and writes through dependency [`Ticket`]s.
//! Each declared value type gets a [`ValueStorage`] that decides whether
//! values live inline or behind a chunk pointer in a [`ChunkStore`].
//!
//! # Key Types
//!
//! - [`Schema`] / [`FieldDef`] -- immutable type descriptions
//! - [`Instance`] / [`Value`] -- runtime values addressed by slot
//! - [`StructPipe`] -- the compiled program, cached per schema and layout
//! - [`DependencyResolver`] / [`Ticket`] -- minimal field sets for partial I/O
//! - [`ValueStorage`] -- per-type inline or reference encoding
//! - [`DataProvider`] -- chunk store, type registry and configuration
//!
//! # Layouts
//!
//! [`StructPipe::standard`] uses the smallest encoding of every field.
//! [`StructPipe::fixed`] gives every instance the same width, storing
//! variable-size values by reference. [`StructPipe::fixed_varying`] is a
//! fixed layout whose number widths are chosen by a [`VaryingSizeProvider`].
//!
//! [`ChunkStore`]: cairn_store::ChunkStore

mod cache;
pub mod compiler;
pub mod config;
pub mod dependency;
pub mod error;
pub mod field;
pub mod pipe;
pub mod provider;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod value;
pub mod varying;

pub use compiler::{CompilerKey, FixedCompiler, PipeFieldCompiler, StandardCompiler, VaryingCompiler};
pub use config::PipeConfig;
pub use dependency::{DependencyResolver, Ticket};
pub use error::{PipeError, PipeResult};
pub use field::{Field, FieldCodec, FieldGenerator, FieldSet};
pub use pipe::{SkipCommand, StructPipe};
pub use provider::DataProvider;
pub use registry::TypeRegistry;
pub use schema::{
    DeclaredType, FieldDef, FieldKind, Generator, Schema, SchemaBuilder, SchemaId, SchemaKind,
    SealedType, SelfRef, StorageRule, TypeKey, WrapperType,
};
pub use storage::{make_storage, PipeRef, ValueStorage};
pub use value::{Handle, Instance, Value};
pub use varying::{MinimalWidths, VaryingSizeProvider, VaryingStep};

pub use cairn_types::{ChunkPointer, NumberSize, PrimitiveKind, SizeDescriptor};

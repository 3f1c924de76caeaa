//! Values whose concrete type is only known at runtime: sealed variants
//! chosen by tag, and open values tagged with a registry type id.

use std::sync::Arc;

use cairn_store::{varint_len, ContentReader, ContentWriter, RandomIo};
use cairn_types::{ChunkPointer, SizeDescriptor};

use crate::error::{PipeError, PipeResult};
use crate::pipe::StructPipe;
use crate::provider::DataProvider;
use crate::schema::{SealedType, StorageRule};
use crate::value::{Instance, Value};

use super::{make_storage, ValueStorage};

pub(crate) fn tag_of(sealed: &SealedType, instance: &Instance) -> PipeResult<u32> {
    sealed
        .tag_of(instance.schema())
        .ok_or_else(|| PipeError::mismatch(sealed.name(), instance.schema().name()))
}

pub(crate) fn variant_pipe(sealed: &SealedType, tag: u32) -> PipeResult<Arc<StructPipe>> {
    let schema = sealed.variant(tag).ok_or(PipeError::UnknownTypeId(tag))?;
    StructPipe::standard(schema)
}

/// Default storage for a registered type id.
pub(crate) fn any_storage(provider: &DataProvider, id: u32) -> PipeResult<Arc<ValueStorage>> {
    let declared = provider.registry().resolve(id)?;
    make_storage(&declared, StorageRule::Default)
}

// ---------------------------------------------------------------------------
// Sealed, inline: varint tag then the variant body. Tag 0 is null.
// ---------------------------------------------------------------------------

pub(crate) fn write_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
) -> PipeResult<()> {
    match value {
        Value::Null => Ok(dest.write_varint(0)?),
        Value::Struct(inst) => {
            let tag = tag_of(sealed, inst)?;
            dest.write_varint(u64::from(tag))?;
            variant_pipe(sealed, tag)?.write(provider, dest, inst)
        }
        other => Err(PipeError::mismatch(sealed.name(), other.type_name())),
    }
}

fn read_tag(src: &mut dyn ContentReader) -> PipeResult<u32> {
    let tag = src.read_varint()?;
    u32::try_from(tag).map_err(|_| PipeError::UnknownTypeId(u32::MAX))
}

pub(crate) fn read_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    src: &mut dyn ContentReader,
) -> PipeResult<Value> {
    match read_tag(src)? {
        0 => Ok(Value::Null),
        tag => Ok(Value::Struct(variant_pipe(sealed, tag)?.read_new(provider, src)?)),
    }
}

pub(crate) fn skip_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    src: &mut dyn ContentReader,
) -> PipeResult<()> {
    match read_tag(src)? {
        0 => Ok(()),
        tag => variant_pipe(sealed, tag)?.skip(provider, src),
    }
}

pub(crate) fn sealed_size(
    provider: &DataProvider,
    sealed: &SealedType,
    value: &Value,
) -> PipeResult<u64> {
    match value {
        Value::Null => Ok(1),
        Value::Struct(inst) => {
            let tag = tag_of(sealed, inst)?;
            let body = variant_pipe(sealed, tag)?.size_of(provider, inst)?;
            Ok(varint_len(u64::from(tag)) + body)
        }
        other => Err(PipeError::mismatch(sealed.name(), other.type_name())),
    }
}

/// Union over the null tag and every variant's tag plus body.
pub(crate) fn sealed_descriptor(sealed: &SealedType) -> SizeDescriptor {
    let mut acc = SizeDescriptor::Fixed(1);
    for (i, variant) in sealed.variants().iter().enumerate() {
        let tag = i as u64 + 1;
        let body = match StructPipe::standard(variant) {
            Ok(pipe) => pipe.size_descriptor(),
            Err(_) => return SizeDescriptor::unknown(1),
        };
        acc = acc.union(SizeDescriptor::Fixed(varint_len(tag)) + body);
    }
    acc
}

pub(crate) fn sealed_needs_removal(sealed: &SealedType) -> bool {
    sealed
        .variants()
        .iter()
        .any(|v| StructPipe::standard(v).map_or(true, |pipe| pipe.needs_removal()))
}

pub(crate) fn release_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    match read_tag(io)? {
        0 => Ok(Vec::new()),
        tag => variant_pipe(sealed, tag)?.notify_removal(provider, io, dereference),
    }
}

// ---------------------------------------------------------------------------
// Open values, inline: varint type id then the Default body. Id 0 is null.
// ---------------------------------------------------------------------------

pub(crate) fn write_any(
    provider: &DataProvider,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
) -> PipeResult<()> {
    let id = provider.registry().id_of(value)?;
    dest.write_varint(u64::from(id))?;
    if id == 0 {
        return Ok(());
    }
    any_storage(provider, id)?.write(provider, dest, value, &mut ChunkPointer::null())
}

pub(crate) fn read_any(provider: &DataProvider, src: &mut dyn ContentReader) -> PipeResult<Value> {
    match read_tag(src)? {
        0 => Ok(Value::Null),
        id => any_storage(provider, id)?.read_new(provider, src, &mut ChunkPointer::null()),
    }
}

pub(crate) fn skip_any(provider: &DataProvider, src: &mut dyn ContentReader) -> PipeResult<()> {
    match read_tag(src)? {
        0 => Ok(()),
        id => any_storage(provider, id)?.skip(provider, src),
    }
}

pub(crate) fn any_size(provider: &DataProvider, value: &Value) -> PipeResult<u64> {
    let id = provider.registry().id_of(value)?;
    if id == 0 {
        return Ok(1);
    }
    let body = any_storage(provider, id)?.size_of(provider, value)?;
    Ok(varint_len(u64::from(id)) + body)
}

pub(crate) fn release_any(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    match read_tag(io)? {
        0 => Ok(Vec::new()),
        id => any_storage(provider, id)?.notify_removal(provider, io, dereference),
    }
}

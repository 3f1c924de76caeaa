//! Values stored out of line, behind a chunk pointer in the slot.
//!
//! The first non-null write into a slot whose companion pointer is null
//! allocates a chunk; later writes rewrite that chunk in place inside an
//! atomic scope. Writing null stores a null pointer and forgets the chunk,
//! which the caller is expected to have collected with `notify_removal`.

use std::sync::Arc;

use cairn_store::{varint_len, AtomicWriteBuffer, ContentReader, ContentWriter, RandomIo, StoreError};
use cairn_types::ChunkPointer;

use crate::error::{PipeError, PipeResult};
use crate::field::write_zeros;
use crate::pipe::StructPipe;
use crate::provider::DataProvider;
use crate::schema::{Schema, SealedType};
use crate::value::{Handle, Value};

use super::dynamic::{any_storage, tag_of, variant_pipe};
use super::embedded::{expect_instance, PipeRef};
use super::scalar::decode_text;

/// Width of a `u32` type id or tag followed by a fixed pointer.
pub(crate) const TAGGED_BYTES: u64 = 4 + ChunkPointer::FIXED_BYTES;

/// Write a body into the slot's chunk, allocating one if needed.
fn store_body<F>(
    provider: &DataProvider,
    reference: &mut ChunkPointer,
    size_hint: u64,
    body: F,
) -> PipeResult<ChunkPointer>
where
    F: FnOnce(&mut dyn RandomIo) -> PipeResult<()>,
{
    if !reference.is_null() && provider.store().contains(*reference) {
        let mut io = provider.open(*reference)?;
        io.set_position(0);
        AtomicWriteBuffer::scope(io.as_mut(), |tx| {
            body(tx)?;
            let end = tx.position();
            tx.set_size(end)?;
            Ok::<(), PipeError>(())
        })?;
    } else {
        *reference = provider.allocate_with(size_hint, body)?;
    }
    Ok(*reference)
}

fn load_body<T, F>(provider: &DataProvider, ptr: ChunkPointer, f: F) -> PipeResult<T>
where
    F: FnOnce(&mut dyn RandomIo) -> PipeResult<T>,
{
    let mut io = provider.open(ptr)?;
    io.set_position(0);
    f(io.as_mut())
}

fn read_pointer(src: &mut dyn ContentReader) -> PipeResult<ChunkPointer> {
    Ok(ChunkPointer::new(src.read_u64_le()?))
}

fn clear_slot(io: &mut dyn RandomIo, at: u64, width: u64) -> PipeResult<()> {
    let end = io.position();
    io.set_position(at);
    write_zeros(io, width)?;
    io.set_position(end);
    Ok(())
}

/// Collect an 8-byte reference slot and, through `walk`, its pointee.
fn release_fixed<F>(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    dereference: bool,
    walk: F,
) -> PipeResult<Vec<ChunkPointer>>
where
    F: FnOnce(&mut dyn RandomIo) -> PipeResult<Vec<ChunkPointer>>,
{
    let at = io.position();
    let ptr = read_pointer(io)?;
    if ptr.is_null() {
        return Ok(Vec::new());
    }
    let mut out = vec![ptr];
    out.extend(load_body(provider, ptr, walk)?);
    if dereference {
        clear_slot(io, at, ChunkPointer::FIXED_BYTES)?;
    }
    Ok(out)
}

/// Collect a tagged slot (`u32` tag or id, then pointer).
fn release_tagged<F>(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    dereference: bool,
    walk: F,
) -> PipeResult<Vec<ChunkPointer>>
where
    F: FnOnce(u32, &mut dyn RandomIo) -> PipeResult<Vec<ChunkPointer>>,
{
    let at = io.position();
    let tag = io.read_u32_le()?;
    let ptr = read_pointer(io)?;
    if tag == 0 || ptr.is_null() {
        return Ok(Vec::new());
    }
    let mut out = vec![ptr];
    out.extend(load_body(provider, ptr, |body| walk(tag, body))?);
    if dereference {
        clear_slot(io, at, TAGGED_BYTES)?;
    }
    Ok(out)
}

fn dangling(what: &str) -> PipeError {
    StoreError::Corrupt(format!("{what} with a null pointer")).into()
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

pub(crate) fn write_string(
    provider: &DataProvider,
    dest: &mut dyn ContentWriter,
    value: &Value,
    reference: &mut ChunkPointer,
) -> PipeResult<()> {
    let ptr = match value {
        Value::Null => {
            *reference = ChunkPointer::null();
            ChunkPointer::null()
        }
        Value::Str(s) => store_body(provider, reference, s.len() as u64, |io| {
            Ok(io.write_all(s.as_bytes())?)
        })?,
        other => return Err(PipeError::mismatch("string", other.type_name())),
    };
    Ok(dest.write_u64_le(ptr.id())?)
}

pub(crate) fn read_string(
    provider: &DataProvider,
    src: &mut dyn ContentReader,
    reference: &mut ChunkPointer,
) -> PipeResult<Value> {
    let ptr = read_pointer(src)?;
    *reference = ptr;
    if ptr.is_null() {
        return Ok(Value::Null);
    }
    load_body(provider, ptr, |io| {
        let len = io.remaining();
        Ok(Value::Str(decode_text(io.read_bytes(len)?)?))
    })
}

pub(crate) fn release_string(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    release_fixed(provider, io, dereference, |_| Ok(Vec::new()))
}

// ---------------------------------------------------------------------------
// Structs
// ---------------------------------------------------------------------------

pub(crate) fn write_struct(
    provider: &DataProvider,
    pipe: &PipeRef,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
    reference: &mut ChunkPointer,
) -> PipeResult<()> {
    let ptr = if value.is_null() {
        *reference = ChunkPointer::null();
        ChunkPointer::null()
    } else {
        let inst = expect_instance(pipe.schema(), value)?;
        let pipe = pipe.get()?;
        let hint = pipe.size_of(provider, inst)?;
        store_body(provider, reference, hint, |io| pipe.write(provider, io, inst))?
    };
    Ok(dest.write_u64_le(ptr.id())?)
}

pub(crate) fn read_struct(
    provider: &DataProvider,
    pipe: &PipeRef,
    src: &mut dyn ContentReader,
    reference: &mut ChunkPointer,
) -> PipeResult<Value> {
    let ptr = read_pointer(src)?;
    *reference = ptr;
    if ptr.is_null() {
        return Ok(Value::Null);
    }
    let pipe = pipe.get()?;
    load_body(provider, ptr, |io| Ok(Value::Struct(pipe.read_new(provider, io)?)))
}

pub(crate) fn release_struct(
    provider: &DataProvider,
    pipe: &PipeRef,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    let pipe = pipe.get()?;
    release_fixed(provider, io, dereference, |body| {
        pipe.notify_removal(provider, body, false)
    })
}

// ---------------------------------------------------------------------------
// Unmanaged handles
// ---------------------------------------------------------------------------

fn write_ptr(dest: &mut dyn ContentWriter, fixed: bool, ptr: ChunkPointer) -> PipeResult<()> {
    if fixed {
        Ok(dest.write_u64_le(ptr.id())?)
    } else {
        Ok(dest.write_varint(ptr.id())?)
    }
}

fn read_ptr(src: &mut dyn ContentReader, fixed: bool) -> PipeResult<ChunkPointer> {
    let id = if fixed {
        src.read_u64_le()?
    } else {
        src.read_varint()?
    };
    Ok(ChunkPointer::new(id))
}

pub(crate) fn write_handle(
    dest: &mut dyn ContentWriter,
    schema: &Schema,
    fixed: bool,
    value: &Value,
) -> PipeResult<()> {
    let ptr = match value {
        Value::Null => ChunkPointer::null(),
        Value::Handle(h) if h.schema().id() == schema.id() => h.ptr(),
        other => {
            return Err(PipeError::mismatch(
                format!("handle<{}>", schema.name()),
                other.type_name(),
            ))
        }
    };
    write_ptr(dest, fixed, ptr)
}

pub(crate) fn read_handle(
    src: &mut dyn ContentReader,
    schema: &Arc<Schema>,
    fixed: bool,
) -> PipeResult<Value> {
    let ptr = read_ptr(src, fixed)?;
    if ptr.is_null() {
        Ok(Value::Null)
    } else {
        Ok(Value::Handle(Handle::new(schema, ptr)))
    }
}

pub(crate) fn skip_handle(src: &mut dyn ContentReader, fixed: bool) -> PipeResult<()> {
    read_ptr(src, fixed).map(|_| ())
}

pub(crate) fn handle_size(fixed: bool, value: &Value) -> PipeResult<u64> {
    if fixed {
        return Ok(ChunkPointer::FIXED_BYTES);
    }
    match value {
        Value::Null => Ok(1),
        Value::Handle(h) => Ok(varint_len(h.ptr().id())),
        other => Err(PipeError::mismatch("handle", other.type_name())),
    }
}

/// Collect a handle slot and the pointers inside its pointee.
///
/// A variable-width slot is cleared with a padded zero varint so that its
/// width, and every offset after it, stays the same.
pub(crate) fn release_handle(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    schema: &Arc<Schema>,
    fixed: bool,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    let at = io.position();
    let ptr = read_ptr(io, fixed)?;
    if ptr.is_null() {
        return Ok(Vec::new());
    }
    let pipe = StructPipe::standard(schema)?;
    let mut out = vec![ptr];
    out.extend(load_body(provider, ptr, |body| {
        pipe.notify_removal(provider, body, false)
    })?);
    if dereference {
        let end = io.position();
        let width = end - at;
        io.set_position(at);
        for _ in 1..width {
            io.write_u8(0x80)?;
        }
        io.write_u8(0)?;
        io.set_position(end);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Sealed variants
// ---------------------------------------------------------------------------

pub(crate) fn write_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
    reference: &mut ChunkPointer,
) -> PipeResult<()> {
    let (tag, ptr) = match value {
        Value::Null => {
            *reference = ChunkPointer::null();
            (0, ChunkPointer::null())
        }
        Value::Struct(inst) => {
            let tag = tag_of(sealed, inst)?;
            let pipe = variant_pipe(sealed, tag)?;
            let hint = pipe.size_of(provider, inst)?;
            let ptr = store_body(provider, reference, hint, |io| pipe.write(provider, io, inst))?;
            (tag, ptr)
        }
        other => return Err(PipeError::mismatch(sealed.name(), other.type_name())),
    };
    dest.write_u32_le(tag)?;
    Ok(dest.write_u64_le(ptr.id())?)
}

pub(crate) fn read_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    src: &mut dyn ContentReader,
    reference: &mut ChunkPointer,
) -> PipeResult<Value> {
    let tag = src.read_u32_le()?;
    let ptr = read_pointer(src)?;
    *reference = ptr;
    if tag == 0 {
        return Ok(Value::Null);
    }
    if ptr.is_null() {
        return Err(dangling(sealed.name()));
    }
    let pipe = variant_pipe(sealed, tag)?;
    load_body(provider, ptr, |io| Ok(Value::Struct(pipe.read_new(provider, io)?)))
}

pub(crate) fn release_sealed(
    provider: &DataProvider,
    sealed: &SealedType,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    release_tagged(provider, io, dereference, |tag, body| {
        variant_pipe(sealed, tag)?.notify_removal(provider, body, false)
    })
}

// ---------------------------------------------------------------------------
// Runtime-typed values
// ---------------------------------------------------------------------------

pub(crate) fn write_any(
    provider: &DataProvider,
    dest: &mut dyn ContentWriter,
    value: &mut Value,
    reference: &mut ChunkPointer,
) -> PipeResult<()> {
    let id = provider.registry().id_of(value)?;
    let ptr = if id == 0 {
        *reference = ChunkPointer::null();
        ChunkPointer::null()
    } else {
        let storage = any_storage(provider, id)?;
        let hint = storage.size_of(provider, value)?;
        store_body(provider, reference, hint, |io| {
            storage.write(provider, io, value, &mut ChunkPointer::null())
        })?
    };
    dest.write_u32_le(id)?;
    Ok(dest.write_u64_le(ptr.id())?)
}

pub(crate) fn read_any(
    provider: &DataProvider,
    src: &mut dyn ContentReader,
    reference: &mut ChunkPointer,
) -> PipeResult<Value> {
    let id = src.read_u32_le()?;
    let ptr = read_pointer(src)?;
    *reference = ptr;
    if id == 0 {
        return Ok(Value::Null);
    }
    if ptr.is_null() {
        return Err(dangling("typed reference"));
    }
    let storage = any_storage(provider, id)?;
    load_body(provider, ptr, |io| {
        storage.read_new(provider, io, &mut ChunkPointer::null())
    })
}

pub(crate) fn release_any(
    provider: &DataProvider,
    io: &mut dyn RandomIo,
    dereference: bool,
) -> PipeResult<Vec<ChunkPointer>> {
    release_tagged(provider, io, dereference, |id, body| {
        any_storage(provider, id)?.notify_removal(provider, body, false)
    })
}

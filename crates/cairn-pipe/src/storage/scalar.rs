//! Primitive and inline text encodings.

use cairn_store::{varint_len, ContentReader, ContentWriter, StoreError};
use cairn_types::PrimitiveKind;

use crate::error::{PipeError, PipeResult};
use crate::value::Value;

pub(crate) fn write_primitive(
    dest: &mut dyn ContentWriter,
    kind: PrimitiveKind,
    value: &Value,
) -> PipeResult<()> {
    match (kind, value) {
        (PrimitiveKind::Bool, Value::Bool(v)) => dest.write_u8(u8::from(*v))?,
        (PrimitiveKind::I8, Value::I8(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::I16, Value::I16(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::I32, Value::I32(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::I64, Value::I64(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::U8, Value::U8(v)) => dest.write_u8(*v)?,
        (PrimitiveKind::U16, Value::U16(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::U32, Value::U32(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::U64, Value::U64(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::F32, Value::F32(v)) => dest.write_all(&v.to_le_bytes())?,
        (PrimitiveKind::F64, Value::F64(v)) => dest.write_all(&v.to_le_bytes())?,
        (kind, other) => return Err(PipeError::mismatch(kind.name(), other.type_name())),
    }
    Ok(())
}

pub(crate) fn read_primitive(src: &mut dyn ContentReader, kind: PrimitiveKind) -> PipeResult<Value> {
    let mut b = [0u8; 8];
    src.read_exact(&mut b[..kind.bytes() as usize])?;
    let b2 = [b[0], b[1]];
    let b4 = [b[0], b[1], b[2], b[3]];
    Ok(match kind {
        PrimitiveKind::Bool => match b[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => return Err(StoreError::Corrupt(format!("bool byte {other}")).into()),
        },
        PrimitiveKind::I8 => Value::I8(i8::from_le_bytes([b[0]])),
        PrimitiveKind::I16 => Value::I16(i16::from_le_bytes(b2)),
        PrimitiveKind::I32 => Value::I32(i32::from_le_bytes(b4)),
        PrimitiveKind::I64 => Value::I64(i64::from_le_bytes(b)),
        PrimitiveKind::U8 => Value::U8(b[0]),
        PrimitiveKind::U16 => Value::U16(u16::from_le_bytes(b2)),
        PrimitiveKind::U32 => Value::U32(u32::from_le_bytes(b4)),
        PrimitiveKind::U64 => Value::U64(u64::from_le_bytes(b)),
        PrimitiveKind::F32 => Value::F32(f32::from_le_bytes(b4)),
        PrimitiveKind::F64 => Value::F64(f64::from_le_bytes(b)),
    })
}

/// Decode UTF-8 text read from a stream or chunk.
pub(crate) fn decode_text(bytes: Vec<u8>) -> PipeResult<String> {
    String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(format!("invalid utf-8: {e}")).into())
}

// Inline text: varint(len + 1) then the bytes; a zero prefix is null.

pub(crate) fn write_inline_string(dest: &mut dyn ContentWriter, value: &Value) -> PipeResult<()> {
    match value {
        Value::Null => Ok(dest.write_varint(0)?),
        Value::Str(s) => {
            dest.write_varint(s.len() as u64 + 1)?;
            Ok(dest.write_all(s.as_bytes())?)
        }
        other => Err(PipeError::mismatch("string", other.type_name())),
    }
}

pub(crate) fn read_inline_string(src: &mut dyn ContentReader) -> PipeResult<Value> {
    match src.read_varint()? {
        0 => Ok(Value::Null),
        n => Ok(Value::Str(decode_text(src.read_bytes(n - 1)?)?)),
    }
}

pub(crate) fn skip_inline_string(src: &mut dyn ContentReader) -> PipeResult<()> {
    let n = src.read_varint()?;
    Ok(src.skip_exact(n.saturating_sub(1))?)
}

pub(crate) fn inline_string_size(value: &Value) -> PipeResult<u64> {
    match value {
        Value::Null => Ok(1),
        Value::Str(s) => Ok(varint_len(s.len() as u64 + 1) + s.len() as u64),
        other => Err(PipeError::mismatch("string", other.type_name())),
    }
}
